//! Throttler cache: exactly one started [`Throttler`](crate::throttler::Throttler) per
//! credential identity.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`CredentialIdentity`] | Immutable cache key: environment or application credentials |
//! | [`ThrottlerCache`] | Atomic get-or-create registry, no eviction |
//! | [`ProviderApiFactory`] | Builds the provider access for a new identity |
//!
//! The credentials-type discriminator of host parameter maps is resolved once, at the
//! boundary, by [`CredentialIdentity::from_params`].
//!
//! ## Example
//!
//! ```rust
//! use cloud_provisioner::cache::ThrottlerCache;
//! use cloud_provisioner::config::ThrottlerConfig;
//! use cloud_provisioner::connector::InMemoryProvider;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let cache = ThrottlerCache::with_provider(
//!     ThrottlerConfig::default(),
//!     Arc::new(InMemoryProvider::new()),
//! );
//! let a = cache.get_or_create_by_env("AZURE", "sub-1").unwrap();
//! let b = cache.get_or_create_by_env("AZURE", "sub-1").unwrap();
//! assert!(Arc::ptr_eq(&a, &b));
//! # });
//! ```

mod key;
mod manager;

pub use key::{
    CredentialIdentity, PARAM_CLIENT_ID, PARAM_CLIENT_SECRET, PARAM_CREDENTIALS_TYPE,
    PARAM_ENVIRONMENT, PARAM_SUBSCRIPTION_ID, PARAM_TENANT_ID,
};
pub use manager::{ProviderApiFactory, ThrottlerCache, ThrottlerCacheStats};
