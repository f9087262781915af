//! Retry decisions for failed throttler tasks.

use crate::config::RetryConfig;
use crate::Error;
use std::time::Duration;

/// What the lane should do with a task whose attempt just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Re-enqueue at the tail of the lane after `delay`.
    Retry { delay: Duration },
    /// Fail the task's future with the error.
    Fail,
}

/// Exponential backoff over transient failures. No jitter: the same error and attempt
/// always yield the same decision.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        let min_delay = Duration::from_millis(config.min_delay_ms);
        Self {
            max_retries: config.max_retries,
            min_delay,
            max_delay: Duration::from_millis(config.max_delay_ms).max(min_delay),
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// `min_delay * 2^attempt`, capped at `max_delay`. A provider hint wins over the
    /// computed value but is still capped.
    pub fn backoff_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let base = self.min_delay.saturating_mul(factor);
        retry_after.unwrap_or(base).min(self.max_delay)
    }

    /// `attempt` is 0-based: the first failure is attempt 0.
    pub fn decide(&self, err: &Error, attempt: u32) -> Decision {
        if err.is_retryable() && attempt < self.max_retries {
            Decision::Retry {
                delay: self.backoff_delay(attempt, err.retry_after()),
            }
        } else {
            Decision::Fail
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(&RetryConfig::new(max_retries).with_delays(
            Duration::from_millis(100),
            Duration::from_millis(1_000),
        ))
    }

    #[test]
    fn transient_retried_until_max() {
        let p = policy(2);
        let err = Error::transient("blip");
        assert_eq!(
            p.decide(&err, 0),
            Decision::Retry {
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(
            p.decide(&err, 1),
            Decision::Retry {
                delay: Duration::from_millis(200)
            }
        );
        assert_eq!(p.decide(&err, 2), Decision::Fail);
    }

    #[test]
    fn terminal_kinds_fail_immediately() {
        let p = policy(5);
        assert_eq!(p.decide(&Error::quota("limit"), 0), Decision::Fail);
        assert_eq!(p.decide(&Error::fatal("boom"), 0), Decision::Fail);
        assert_eq!(
            p.decide(&Error::timeout(Duration::from_secs(1)), 0),
            Decision::Fail
        );
    }

    #[test]
    fn backoff_is_capped() {
        let p = policy(10);
        assert_eq!(p.backoff_delay(8, None), Duration::from_millis(1_000));
        assert_eq!(p.backoff_delay(40, None), Duration::from_millis(1_000));
    }

    #[test]
    fn provider_hint_wins_but_is_capped() {
        let p = policy(3);
        let hinted = Error::throttled("429", Duration::from_millis(350));
        assert_eq!(
            p.decide(&hinted, 0),
            Decision::Retry {
                delay: Duration::from_millis(350)
            }
        );
        let huge = Error::throttled("429", Duration::from_secs(60));
        assert_eq!(
            p.decide(&huge, 0),
            Decision::Retry {
                delay: Duration::from_millis(1_000)
            }
        );
    }

    #[test]
    fn none_never_retries() {
        assert_eq!(
            RetryPolicy::none().decide(&Error::transient("x"), 0),
            Decision::Fail
        );
    }
}
