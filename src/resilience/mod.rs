//! Resilience primitives used by the throttler lanes.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`rate_limiter`] | Token bucket pacing a lane, tightened by provider backoff signals |
//! | [`retry`] | Retry decisions and exponential backoff for transient failures |
//!
//! ## Rate Limiter
//!
//! ```rust
//! use cloud_provisioner::resilience::rate_limiter::{RateLimiter, RateLimiterConfig};
//!
//! # tokio_test::block_on(async {
//! let limiter = RateLimiter::new(RateLimiterConfig::from_rps(10.0).unwrap());
//! if limiter.try_acquire().await {
//!     // dispatch the next task...
//! }
//! # });
//! ```
//!
//! ## Retry Policy
//!
//! ```rust
//! use cloud_provisioner::config::RetryConfig;
//! use cloud_provisioner::resilience::retry::{Decision, RetryPolicy};
//! use cloud_provisioner::Error;
//!
//! let policy = RetryPolicy::new(&RetryConfig::new(3));
//! assert!(matches!(policy.decide(&Error::transient("blip"), 0), Decision::Retry { .. }));
//! assert_eq!(policy.decide(&Error::quota("limit"), 0), Decision::Fail);
//! ```

pub mod rate_limiter;
pub mod retry;
