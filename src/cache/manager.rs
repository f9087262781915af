//! Throttler cache.

use super::key::CredentialIdentity;
use crate::config::ThrottlerConfig;
use crate::connector::ProviderApi;
use crate::throttler::Throttler;
use crate::Result;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Builds the provider access for a newly seen identity.
///
/// Called with the cache entry locked; implementations must not call back into the cache.
pub trait ProviderApiFactory: Send + Sync {
    fn create(&self, identity: &CredentialIdentity) -> Result<Arc<dyn ProviderApi>>;
}

impl<F> ProviderApiFactory for F
where
    F: Fn(&CredentialIdentity) -> Result<Arc<dyn ProviderApi>> + Send + Sync,
{
    fn create(&self, identity: &CredentialIdentity) -> Result<Arc<dyn ProviderApi>> {
        self(identity)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ThrottlerCacheStats {
    pub entries: usize,
    pub created: u64,
    pub hits: u64,
}

/// Process-wide registry of started throttlers, one per [`CredentialIdentity`].
///
/// Entries are never evicted; [`shutdown_all`](Self::shutdown_all) is the only way out.
pub struct ThrottlerCache {
    throttlers: DashMap<CredentialIdentity, Arc<Throttler>>,
    config: ThrottlerConfig,
    factory: Arc<dyn ProviderApiFactory>,
    created: AtomicU64,
    hits: AtomicU64,
}

impl ThrottlerCache {
    pub fn new(config: ThrottlerConfig, factory: Arc<dyn ProviderApiFactory>) -> Self {
        Self {
            throttlers: DashMap::new(),
            config,
            factory,
            created: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    /// Cache whose throttlers all talk to the same provider instance.
    pub fn with_provider(config: ThrottlerConfig, api: Arc<dyn ProviderApi>) -> Self {
        let factory = move |_: &CredentialIdentity| -> Result<Arc<dyn ProviderApi>> { Ok(Arc::clone(&api)) };
        Self::new(config, Arc::new(factory))
    }

    pub fn config(&self) -> &ThrottlerConfig {
        &self.config
    }

    /// Returns the started throttler for `identity`, building and starting it on first use.
    ///
    /// Concurrent first callers all receive the same instance; construction runs once while
    /// the entry is locked.
    pub fn get_or_create(&self, identity: CredentialIdentity) -> Result<Arc<Throttler>> {
        if let Some(existing) = self.throttlers.get(&identity) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(existing.value()));
        }

        match self.throttlers.entry(identity) {
            Entry::Occupied(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Arc::clone(entry.get()))
            }
            Entry::Vacant(entry) => {
                let label = entry.key().label();
                let api = self.factory.create(entry.key())?;
                let throttler = Arc::new(Throttler::new(label.clone(), self.config.clone(), api));
                throttler.start()?;
                self.created.fetch_add(1, Ordering::Relaxed);
                info!(
                    identity = %label,
                    subscription_id = entry.key().subscription_id(),
                    "created throttler"
                );
                entry.insert(Arc::clone(&throttler));
                Ok(throttler)
            }
        }
    }

    pub fn get_or_create_by_env(
        &self,
        environment: &str,
        subscription_id: &str,
    ) -> Result<Arc<Throttler>> {
        self.get_or_create(CredentialIdentity::environment(environment, subscription_id))
    }

    pub fn get_or_create_by_credentials(
        &self,
        client_id: &str,
        tenant_id: &str,
        secret: &str,
        subscription_id: &str,
    ) -> Result<Arc<Throttler>> {
        self.get_or_create(CredentialIdentity::application(
            client_id,
            tenant_id,
            secret,
            subscription_id,
        ))
    }

    /// Resolves a host parameter map (see [`CredentialIdentity::from_params`]).
    pub fn get_or_create_throttler(&self, params: &HashMap<String, String>) -> Result<Arc<Throttler>> {
        self.get_or_create(CredentialIdentity::from_params(params)?)
    }

    pub fn get(&self, identity: &CredentialIdentity) -> Option<Arc<Throttler>> {
        self.throttlers.get(identity).map(|e| Arc::clone(e.value()))
    }

    pub fn len(&self) -> usize {
        self.throttlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.throttlers.is_empty()
    }

    pub fn stats(&self) -> ThrottlerCacheStats {
        ThrottlerCacheStats {
            entries: self.throttlers.len(),
            created: self.created.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
        }
    }

    /// Shuts every cached throttler down and empties the cache. For process teardown.
    pub fn shutdown_all(&self) {
        let drained: Vec<Arc<Throttler>> = self
            .throttlers
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        self.throttlers.clear();
        debug!(count = drained.len(), "shutting down cached throttlers");
        for throttler in drained {
            throttler.shutdown();
        }
    }
}

impl std::fmt::Debug for ThrottlerCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottlerCache")
            .field("entries", &self.throttlers.len())
            .field("created", &self.created.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
