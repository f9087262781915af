//! Instance state as reported by the provider.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle status of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Scheduled,
    Starting,
    Running,
    Restarting,
    Stopping,
    Stopped,
    Error,
    #[serde(other)]
    Unknown,
}

impl InstanceStatus {
    /// Whether the instance occupies a slot of its image's instance limit.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Scheduled | Self::Starting | Self::Running | Self::Restarting | Self::Stopping
        )
    }
}

/// Snapshot of one instance; also the handle the host passes back for lifecycle calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudInstance {
    pub id: String,
    pub image_id: String,
    #[serde(default)]
    pub name: String,
    pub status: InstanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_address: Option<String>,
    /// Unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CloudInstance {
    pub fn new(
        id: impl Into<String>,
        image_id: impl Into<String>,
        status: InstanceStatus,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            image_id: image_id.into(),
            status,
            network_address: None,
            started_at: None,
            error: None,
        }
    }

    pub fn with_status(mut self, status: InstanceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_network_address(mut self, address: impl Into<String>) -> Self {
        self.network_address = Some(address.into());
        self
    }
}

/// Data handed to a new instance so it can register back with the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceUserData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_address: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_parameters: BTreeMap<String, String>,
}

impl InstanceUserData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agent_name(mut self, name: impl Into<String>) -> Self {
        self.agent_name = Some(name.into());
        self
    }

    pub fn with_server_address(mut self, address: impl Into<String>) -> Self {
        self.server_address = Some(address.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_parameters.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_status_deserializes() {
        let instance: CloudInstance = serde_json::from_value(serde_json::json!({
            "id": "vm-1",
            "image_id": "img",
            "status": "deallocating"
        }))
        .unwrap();
        assert_eq!(instance.status, InstanceStatus::Unknown);
        assert_eq!(instance.name, "");
    }

    #[test]
    fn active_statuses() {
        assert!(InstanceStatus::Running.is_active());
        assert!(InstanceStatus::Scheduled.is_active());
        assert!(!InstanceStatus::Stopped.is_active());
        assert!(!InstanceStatus::Error.is_active());
        assert!(!InstanceStatus::Unknown.is_active());
    }
}
