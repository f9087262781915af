use super::core::CloudClient;
use crate::cache::{CredentialIdentity, ThrottlerCache};
use crate::config::{ProvisionerConfig, DEFAULT_RECONCILE_INTERVAL_MS};
use crate::connector::{CloudApiConnector, ThrottledConnector};
use crate::error_provider::{CloudErrorMap, DEFAULT_ERROR_MESSAGE};
use crate::{Error, ErrorContext, Result};
use std::sync::Arc;
use std::time::Duration;

/// Builder for [`CloudClient`].
///
/// The usual path is [`from_config`](Self::from_config), which resolves the profile's
/// credentials to the cached throttler and wraps it in a [`ThrottledConnector`].
pub struct CloudClientBuilder {
    profile: String,
    connector: Option<Arc<dyn CloudApiConnector>>,
    reconcile_interval: Duration,
    error_message: String,
}

impl CloudClientBuilder {
    pub fn new(profile: impl Into<String>) -> Self {
        Self {
            profile: profile.into(),
            connector: None,
            reconcile_interval: Duration::from_millis(DEFAULT_RECONCILE_INTERVAL_MS),
            error_message: DEFAULT_ERROR_MESSAGE.to_string(),
        }
    }

    /// Profile settings plus the throttler the cache holds for its credentials.
    pub fn from_config(config: &ProvisionerConfig, cache: &ThrottlerCache) -> Result<Self> {
        let identity = CredentialIdentity::from(&config.credentials);
        let throttler = cache.get_or_create(identity)?;
        Ok(Self::new(config.profile.clone())
            .connector(Arc::new(ThrottledConnector::new(throttler)))
            .reconcile_interval(config.reconcile_interval()))
    }

    pub fn connector(mut self, connector: Arc<dyn CloudApiConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    /// Message reported when more than one kind of error is active.
    pub fn error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = message.into();
        self
    }

    pub fn build(self) -> Result<CloudClient> {
        let context = || {
            ErrorContext::new()
                .with_operation("build")
                .with_resource(self.profile.clone())
                .with_source("cloud_client_builder")
        };
        let connector = self.connector.clone().ok_or_else(|| {
            Error::configuration("a connector is required").with_context(context())
        })?;
        if self.reconcile_interval.is_zero() {
            return Err(Error::configuration("reconcile interval must be positive")
                .with_context(context()));
        }
        Ok(CloudClient::new(
            self.profile,
            connector,
            self.reconcile_interval,
            CloudErrorMap::new(self.error_message),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CredentialsConfig, ThrottlerConfig};
    use crate::connector::InMemoryProvider;

    #[test]
    fn connector_is_required() {
        let err = CloudClientBuilder::new("p").build().unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[tokio::test]
    async fn from_config_reuses_cached_throttler() {
        let cache = ThrottlerCache::with_provider(
            ThrottlerConfig::default(),
            Arc::new(InMemoryProvider::new()),
        );
        let mut config = ProvisionerConfig::new(CredentialsConfig::Msi {
            environment: "AZURE".into(),
            subscription_id: "sub-1".into(),
        });
        config.profile = "agents".into();
        config.reconcile_interval_ms = 5_000;

        let first = CloudClientBuilder::from_config(&config, &cache)
            .unwrap()
            .build()
            .unwrap();
        let second = CloudClientBuilder::from_config(&config, &cache)
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(first.profile(), "agents");
        assert_eq!(first.reconcile_interval(), Duration::from_secs(5));
        assert_eq!(second.profile(), "agents");
        assert_eq!(cache.stats().created, 1);
        assert_eq!(cache.stats().hits, 1);
    }
}
