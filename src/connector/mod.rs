//! Provider connector seams.
//!
//! Two traits separate the raw provider from the cloud client:
//!
//! | Trait | Used by | Description |
//! |-------|---------|-------------|
//! | [`ProviderApi`] | [`Throttler`](crate::throttler::Throttler) | Executes one opaque [`ProviderRequest`] and classifies failures |
//! | [`CloudApiConnector`] | [`CloudClient`](crate::client::CloudClient) | Typed lifecycle and query API |
//!
//! [`ThrottledConnector`] implements the typed API by routing every call through the cached
//! throttler of a credential identity, so the cloud client never talks to the provider
//! directly. [`InMemoryProvider`] is a scriptable fake `ProviderApi` for tests and the
//! simulator binary.

mod memory;
mod throttled;

pub use memory::{InMemoryProvider, ProviderCall};
pub use throttled::ThrottledConnector;

use crate::throttler::LaneKind;
use crate::types::{CloudInstance, ImageDetails, InstanceUserData, Subscription};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Provider operations the throttler knows how to route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    ListInstances,
    DescribeInstance,
    ListSubscriptions,
    StartInstance,
    RestartInstance,
    TerminateInstance,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::ListInstances => "list_instances",
            Operation::DescribeInstance => "describe_instance",
            Operation::ListSubscriptions => "list_subscriptions",
            Operation::StartInstance => "start_instance",
            Operation::RestartInstance => "restart_instance",
            Operation::TerminateInstance => "terminate_instance",
        }
    }

    /// Mutating operations go to the action lane, everything else to the read lane.
    pub fn lane(&self) -> LaneKind {
        match self {
            Operation::ListInstances
            | Operation::DescribeInstance
            | Operation::ListSubscriptions => LaneKind::Read,
            Operation::StartInstance
            | Operation::RestartInstance
            | Operation::TerminateInstance => LaneKind::Action,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Operation plus its JSON parameters.
///
/// Parameter shapes:
/// - `list_instances`: `{"image": ImageDetails}` → `[CloudInstance]`
/// - `describe_instance`: `{"image_id", "instance_id"}` → `CloudInstance | null`
/// - `list_subscriptions`: `{}` → `[Subscription]`
/// - `start_instance`: `{"image": ImageDetails, "user_data": InstanceUserData}` → `CloudInstance`
/// - `restart_instance` / `terminate_instance`: `{"image_id", "instance_id"}` → `null`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub operation: Operation,
    pub params: Value,
}

impl ProviderRequest {
    pub fn new(operation: Operation, params: Value) -> Self {
        Self { operation, params }
    }

    /// String parameter lookup, used by provider implementations.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// Request budget a provider reports alongside its responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBudget {
    /// Calls left in the current window.
    pub remaining: u64,
    /// Time until the window resets.
    pub reset_after: Option<Duration>,
}

impl RateBudget {
    pub fn new(remaining: u64, reset_after: Option<Duration>) -> Self {
        Self {
            remaining,
            reset_after,
        }
    }
}

/// Raw provider access for one credential identity.
///
/// Implementations must classify failures: retryable conditions map to
/// [`Error::Transient`](crate::Error::Transient) (with `retry_after` when the provider sent a
/// backoff hint), account limits to `Quota`, everything else to `Fatal`.
/// [`ErrorKind::from_error_class`](crate::ErrorKind::from_error_class) and
/// [`ErrorKind::from_http_status`](crate::ErrorKind::from_http_status) cover the usual codes.
#[async_trait]
pub trait ProviderApi: Send + Sync {
    async fn execute(&self, request: &ProviderRequest) -> Result<Value>;

    /// Budget reported with the most recent response for `lane`.
    ///
    /// Lanes read it after every call and hold dispatch back once it is exhausted.
    fn rate_budget(&self, _lane: LaneKind) -> Option<RateBudget> {
        None
    }

    fn name(&self) -> &str {
        "provider"
    }
}

/// Typed provider API consumed by the cloud client and its images.
///
/// Lifecycle methods return once the provider accepted the request; the resulting state
/// change is picked up by the next reconciliation pass.
#[async_trait]
pub trait CloudApiConnector: Send + Sync {
    async fn fetch_instances(&self, image: &ImageDetails) -> Result<Vec<CloudInstance>>;

    async fn describe_instance(
        &self,
        image_id: &str,
        instance_id: &str,
    ) -> Result<Option<CloudInstance>>;

    async fn start_instance(
        &self,
        image: &ImageDetails,
        user_data: &InstanceUserData,
    ) -> Result<CloudInstance>;

    async fn restart_instance(&self, instance: &CloudInstance) -> Result<()>;

    async fn terminate_instance(&self, instance: &CloudInstance) -> Result<()>;

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutating_operations_use_action_lane() {
        assert_eq!(Operation::StartInstance.lane(), LaneKind::Action);
        assert_eq!(Operation::RestartInstance.lane(), LaneKind::Action);
        assert_eq!(Operation::TerminateInstance.lane(), LaneKind::Action);
        assert_eq!(Operation::ListInstances.lane(), LaneKind::Read);
        assert_eq!(Operation::DescribeInstance.lane(), LaneKind::Read);
        assert_eq!(Operation::ListSubscriptions.lane(), LaneKind::Read);
    }

    #[test]
    fn request_param_lookup() {
        let req = ProviderRequest::new(
            Operation::RestartInstance,
            serde_json::json!({"image_id": "img", "instance_id": 7}),
        );
        assert_eq!(req.param_str("image_id"), Some("img"));
        assert_eq!(req.param_str("instance_id"), None);
        assert_eq!(req.param_str("missing"), None);
    }
}
