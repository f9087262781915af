//! # cloud-provisioner
//!
//! Rate-limited cloud instance provisioning runtime.
//!
//! Manages the lifecycle of virtual-machine-like cloud resources on behalf of an
//! orchestration host while keeping outbound provider requests within the provider's
//! API limits.
//!
//! ## Overview
//!
//! - **One throttler per account**: every credential identity gets exactly one started
//!   [`Throttler`](throttler::Throttler), shared by all clients through the
//!   [`ThrottlerCache`](cache::ThrottlerCache)
//! - **Two lanes**: reads and actions are queued, paced and capped independently
//! - **Graceful degradation**: transient provider failures are retried with backoff,
//!   provider backoff hints slow the whole lane down
//! - **Reconciliation**: a background pass keeps each image's instance set in line with
//!   the provider without racing foreground calls
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cloud_provisioner::cache::ThrottlerCache;
//! use cloud_provisioner::client::CloudClientBuilder;
//! use cloud_provisioner::config::ProvisionerConfig;
//! use cloud_provisioner::connector::InMemoryProvider;
//! use cloud_provisioner::types::{ImageDetails, InstanceUserData};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> cloud_provisioner::Result<()> {
//!     let config = ProvisionerConfig::from_path("config/provisioner.example.yaml")
//!         .await?
//!         .apply_env_overrides()?;
//!     let cache = ThrottlerCache::with_provider(
//!         config.throttler.clone(),
//!         Arc::new(InMemoryProvider::new()),
//!     );
//!
//!     let client = CloudClientBuilder::from_config(&config, &cache)?.build()?;
//!     client
//!         .populate_images(vec![ImageDetails::new("linux-agent").with_max_instances(4)])
//!         .await?;
//!
//!     if client.can_start_new_instance("linux-agent") {
//!         let instance = client
//!             .start_new_instance("linux-agent", &InstanceUserData::new())
//!             .await?;
//!         println!("started {}", instance.id);
//!     }
//!
//!     client.dispose();
//!     cache.shutdown_all();
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`throttler`] | Read/action lanes, FIFO dispatch, retries and timeouts |
//! | [`cache`] | Credential identities and the throttler registry |
//! | [`executor`] | One-shot and fixed-delay tasks owned by a client |
//! | [`client`] | Cloud client, images and reconciliation |
//! | [`error_provider`] | Session error state reported to the host |
//! | [`connector`] | Provider seams, throttled connector and in-memory provider |
//! | [`resilience`] | Rate limiter and retry policy |
//! | [`config`] | YAML configuration and environment overrides |
//! | [`types`] | Images, instances, subscriptions |

pub mod cache;
pub mod client;
pub mod config;
pub mod connector;
pub mod error_provider;
pub mod executor;
pub mod resilience;
pub mod throttler;
pub mod types;

pub use cache::{CredentialIdentity, ThrottlerCache};
pub use client::{CloudClient, CloudClientBuilder};
pub use error_kind::ErrorKind;
pub use error_provider::{ErrorInfo, ErrorRecord, UpdatableErrorProvider};
pub use executor::AsyncTaskExecutor;
pub use throttler::{TaskHandle, Throttler};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub mod error_kind;
pub use error::{Error, ErrorContext};
