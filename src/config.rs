//! Configuration surface consumed by the provisioning runtime.
//!
//! Configuration is plain serde data, usually loaded from a YAML profile:
//!
//! ```yaml
//! profile: build-agents
//! credentials:
//!   type: credentials
//!   client_id: 3f1c...
//!   tenant_id: 72f9...
//!   secret: s3cr3t
//!   subscription_id: 0000-1111
//! throttler:
//!   read: { max_in_flight: 8 }
//!   action: { max_in_flight: 2, requests_per_second: 1.0 }
//!   retry: { max_retries: 3, min_delay_ms: 500, max_delay_ms: 30000 }
//!   task_timeout_ms: 120000
//! reconcile_interval_ms: 60000
//! ```
//!
//! Every throttler knob can be overridden through `CLOUD_*` environment variables, see
//! [`ProvisionerConfig::apply_env_overrides`].

use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default interval between reconciliation passes.
pub const DEFAULT_RECONCILE_INTERVAL_MS: u64 = 60_000;

/// Credential parameters for one provider account.
///
/// The `type` tag is the credentials-type discriminator; it is resolved once into a
/// [`CredentialIdentity`](crate::cache::CredentialIdentity) and never inspected again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialsConfig {
    /// Managed identity of the host machine.
    Msi {
        #[serde(default = "default_environment")]
        environment: String,
        subscription_id: String,
    },
    /// Application (service principal) credentials.
    Credentials {
        client_id: String,
        tenant_id: String,
        secret: String,
        subscription_id: String,
    },
}

fn default_environment() -> String {
    "AZURE".to_string()
}

impl CredentialsConfig {
    pub fn subscription_id(&self) -> &str {
        match self {
            CredentialsConfig::Msi {
                subscription_id, ..
            }
            | CredentialsConfig::Credentials {
                subscription_id, ..
            } => subscription_id,
        }
    }
}

/// Per-lane dispatch limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneConfig {
    /// Maximum tasks executing against the provider at once.
    pub max_in_flight: usize,
    /// Token-bucket dispatch rate; `None` dispatches as fast as the ceiling allows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_second: Option<f64>,
}

impl LaneConfig {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            max_in_flight,
            requests_per_second: None,
        }
    }

    pub fn with_requests_per_second(mut self, rps: f64) -> Self {
        self.requests_per_second = Some(rps);
        self
    }

    fn validate(&self, lane: &str) -> Result<()> {
        if self.max_in_flight == 0 {
            return Err(Error::configuration("max_in_flight must be at least 1").with_context(
                ErrorContext::new()
                    .with_resource(format!("throttler.{}.max_in_flight", lane))
                    .with_source("config"),
            ));
        }
        if let Some(rps) = self.requests_per_second {
            if !rps.is_finite() || rps < 0.0 {
                return Err(Error::configuration(
                    "requests_per_second must be a finite, non-negative number",
                )
                .with_context(
                    ErrorContext::new()
                        .with_resource(format!("throttler.{}.requests_per_second", lane))
                        .with_details(rps.to_string())
                        .with_source("config"),
                ));
            }
        }
        Ok(())
    }
}

/// Retry policy for transient provider failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn with_delays(mut self, min: Duration, max: Duration) -> Self {
        self.min_delay_ms = min.as_millis() as u64;
        self.max_delay_ms = max.as_millis() as u64;
        self
    }
}

/// Settings shared by every throttler the cache creates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottlerConfig {
    pub read: LaneConfig,
    pub action: LaneConfig,
    pub retry: RetryConfig,
    /// Deadline applied by `execute_task`; `None` waits indefinitely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_timeout_ms: Option<u64>,
}

impl Default for ThrottlerConfig {
    fn default() -> Self {
        Self {
            read: LaneConfig::new(8),
            // Providers cap mutations well below reads.
            action: LaneConfig::new(2).with_requests_per_second(1.0),
            retry: RetryConfig::default(),
            task_timeout_ms: None,
        }
    }
}

impl ThrottlerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_read(mut self, lane: LaneConfig) -> Self {
        self.read = lane;
        self
    }

    pub fn with_action(mut self, lane: LaneConfig) -> Self {
        self.action = lane;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        self.read.validate("read")?;
        self.action.validate("action")?;
        if self.retry.min_delay_ms > self.retry.max_delay_ms {
            return Err(Error::configuration("retry.min_delay_ms exceeds retry.max_delay_ms")
                .with_context(ErrorContext::new().with_resource("throttler.retry").with_source("config")));
        }
        if self.task_timeout_ms == Some(0) {
            return Err(Error::configuration("task_timeout_ms must be positive").with_context(
                ErrorContext::new()
                    .with_resource("throttler.task_timeout_ms")
                    .with_source("config"),
            ));
        }
        Ok(())
    }
}

/// Complete configuration of one cloud profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionerConfig {
    /// Human-readable profile description, used in logs.
    #[serde(default = "default_profile")]
    pub profile: String,
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub throttler: ThrottlerConfig,
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,
}

fn default_profile() -> String {
    "default".to_string()
}

fn default_reconcile_interval_ms() -> u64 {
    DEFAULT_RECONCILE_INTERVAL_MS
}

impl ProvisionerConfig {
    pub fn new(credentials: CredentialsConfig) -> Self {
        Self {
            profile: default_profile(),
            credentials,
            throttler: ThrottlerConfig::default(),
            reconcile_interval_ms: DEFAULT_RECONCILE_INTERVAL_MS,
        }
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_yaml_str(&raw)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    /// Applies `CLOUD_*` environment overrides on top of the file values.
    ///
    /// - `CLOUD_READ_MAX_IN_FLIGHT`, `CLOUD_ACTION_MAX_IN_FLIGHT`
    /// - `CLOUD_READ_RPS`, `CLOUD_ACTION_RPS`
    /// - `CLOUD_MAX_RETRIES`, `CLOUD_TASK_TIMEOUT_MS`, `CLOUD_RECONCILE_INTERVAL_MS`
    ///
    /// Unparseable values are ignored.
    pub fn apply_env_overrides(mut self) -> Result<Self> {
        self.apply_overrides(|key| std::env::var(key).ok());
        self.validate()?;
        Ok(self)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let parse_usize = |key: &str| lookup(key).and_then(|s| s.trim().parse::<usize>().ok());
        let parse_u64 = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());
        let parse_f64 = |key: &str| lookup(key).and_then(|s| s.trim().parse::<f64>().ok());

        if let Some(n) = parse_usize("CLOUD_READ_MAX_IN_FLIGHT") {
            self.throttler.read.max_in_flight = n;
        }
        if let Some(n) = parse_usize("CLOUD_ACTION_MAX_IN_FLIGHT") {
            self.throttler.action.max_in_flight = n;
        }
        if let Some(rps) = parse_f64("CLOUD_READ_RPS") {
            self.throttler.read.requests_per_second = Some(rps);
        }
        if let Some(rps) = parse_f64("CLOUD_ACTION_RPS") {
            self.throttler.action.requests_per_second = Some(rps);
        }
        if let Some(n) = parse_u64("CLOUD_MAX_RETRIES") {
            self.throttler.retry.max_retries = n.min(u32::MAX as u64) as u32;
        }
        if let Some(ms) = parse_u64("CLOUD_TASK_TIMEOUT_MS") {
            self.throttler.task_timeout_ms = Some(ms);
        }
        if let Some(ms) = parse_u64("CLOUD_RECONCILE_INTERVAL_MS") {
            self.reconcile_interval_ms = ms;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.credentials.subscription_id().trim().is_empty() {
            return Err(Error::configuration("subscription_id must not be empty").with_context(
                ErrorContext::new()
                    .with_resource("credentials.subscription_id")
                    .with_source("config"),
            ));
        }
        if self.reconcile_interval_ms == 0 {
            return Err(Error::configuration("reconcile_interval_ms must be positive")
                .with_context(ErrorContext::new().with_resource("reconcile_interval_ms").with_source("config")));
        }
        self.throttler.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
profile: build-agents
credentials:
  type: credentials
  client_id: app-1
  tenant_id: tenant-1
  secret: hunter2
  subscription_id: sub-1
throttler:
  read: { max_in_flight: 4 }
  action: { max_in_flight: 1, requests_per_second: 0.5 }
  task_timeout_ms: 2000
"#;

    #[test]
    fn parses_yaml_with_defaults() {
        let config = ProvisionerConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.profile, "build-agents");
        assert_eq!(config.throttler.read.max_in_flight, 4);
        assert_eq!(config.throttler.read.requests_per_second, None);
        assert_eq!(config.throttler.action.requests_per_second, Some(0.5));
        assert_eq!(config.throttler.retry, RetryConfig::default());
        assert_eq!(config.throttler.task_timeout(), Some(Duration::from_secs(2)));
        assert_eq!(config.reconcile_interval(), Duration::from_millis(60_000));
        assert_eq!(config.credentials.subscription_id(), "sub-1");
    }

    #[test]
    fn msi_defaults_environment() {
        let config = ProvisionerConfig::from_yaml_str(
            "credentials:\n  type: msi\n  subscription_id: sub-9\n",
        )
        .unwrap();
        assert_eq!(
            config.credentials,
            CredentialsConfig::Msi {
                environment: "AZURE".to_string(),
                subscription_id: "sub-9".to_string(),
            }
        );
        assert_eq!(config.throttler, ThrottlerConfig::default());
    }

    #[test]
    fn rejects_zero_ceiling() {
        let raw = "credentials:\n  type: msi\n  subscription_id: s\nthrottler:\n  read: { max_in_flight: 0 }\n";
        let err = ProvisionerConfig::from_yaml_str(raw).unwrap_err();
        assert!(err.to_string().contains("throttler.read.max_in_flight"));
    }

    #[test]
    fn rejects_empty_subscription() {
        let raw = "credentials:\n  type: msi\n  subscription_id: ''\n";
        assert!(matches!(
            ProvisionerConfig::from_yaml_str(raw),
            Err(Error::Configuration { .. })
        ));
    }

    #[test]
    fn rejects_unknown_credentials_type() {
        let raw = "credentials:\n  type: password\n  subscription_id: s\n";
        assert!(matches!(
            ProvisionerConfig::from_yaml_str(raw),
            Err(Error::ConfigParse(_))
        ));
    }

    #[test]
    fn overrides_take_precedence() {
        let mut config = ProvisionerConfig::from_yaml_str(SAMPLE).unwrap();
        let env: HashMap<&str, &str> = [
            ("CLOUD_READ_MAX_IN_FLIGHT", "16"),
            ("CLOUD_ACTION_RPS", "2.5"),
            ("CLOUD_RECONCILE_INTERVAL_MS", "5000"),
            ("CLOUD_MAX_RETRIES", "not-a-number"),
        ]
        .into_iter()
        .collect();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.throttler.read.max_in_flight, 16);
        assert_eq!(config.throttler.action.requests_per_second, Some(2.5));
        assert_eq!(config.reconcile_interval_ms, 5000);
        assert_eq!(config.throttler.retry.max_retries, 3);
    }
}
