use serde::Serialize;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimiterSnapshot {
    /// Tokens per second; `0.0` means the bucket never runs dry.
    pub rps: f64,
    pub burst: f64,
    pub tokens: f64,
    /// Estimated wait until dispatch may continue (ms), if currently held back.
    pub estimated_wait_ms: Option<u64>,
    /// Budget the provider reported with its last response, if it reports one.
    pub remaining_budget: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterConfig {
    /// Tokens per second.
    pub rps: f64,
    /// Maximum burst size (tokens).
    pub burst: f64,
}

impl RateLimiterConfig {
    pub fn from_rps(rps: f64) -> Option<Self> {
        if !rps.is_finite() || rps < 0.0 {
            return None;
        }
        Some(Self {
            rps,
            burst: rps.max(1.0),
        })
    }

    /// Bucket that never runs dry; provider backoff signals are still honored.
    pub fn unlimited() -> Self {
        Self {
            rps: 0.0,
            burst: 1.0,
        }
    }

    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = f64::from(burst.max(1));
        self
    }
}

#[derive(Debug)]
struct State {
    tokens: f64,
    last: Instant,
    /// Set when the provider asked us to back off.
    blocked_until: Option<Instant>,
    /// Last budget reported by the provider.
    remaining: Option<u64>,
}

/// Token bucket pacing one throttler lane.
///
/// The bucket itself is static. The provider tightens it at runtime: a throttling
/// response goes through [`RateLimiter::block_for`], a reported request budget through
/// [`RateLimiter::update_budget`].
#[derive(Debug)]
pub struct RateLimiter {
    cfg: RateLimiterConfig,
    state: Mutex<State>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimiterConfig) -> Self {
        let state = Mutex::new(State {
            tokens: cfg.burst,
            last: Instant::now(),
            blocked_until: None,
            remaining: None,
        });
        Self { cfg, state }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.cfg
    }

    fn refill_locked(cfg: &RateLimiterConfig, st: &mut State, now: Instant) {
        let elapsed = now.duration_since(st.last).as_secs_f64();
        if elapsed > 0.0 {
            st.tokens = (st.tokens + elapsed * cfg.rps).min(cfg.burst);
            st.last = now;
        }
    }

    /// Wait needed before the next dispatch, taking a token when none is needed.
    fn try_take_locked(cfg: &RateLimiterConfig, st: &mut State) -> Duration {
        let now = Instant::now();
        if let Some(until) = st.blocked_until {
            if until > now {
                return until - now;
            }
            st.blocked_until = None;
        }
        if cfg.rps <= 0.0 {
            return Duration::ZERO;
        }
        Self::refill_locked(cfg, st, now);
        if st.tokens >= 1.0 {
            st.tokens -= 1.0;
            return Duration::ZERO;
        }
        let missing = (1.0 - st.tokens).max(0.0);
        Duration::from_secs_f64(missing / cfg.rps).max(Duration::from_millis(1))
    }

    /// Take one dispatch token, sleeping until one is available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut st = self.state.lock().await;
                Self::try_take_locked(&self.cfg, &mut st)
            };
            if wait.is_zero() {
                return;
            }
            tokio::time::sleep(wait).await;
        }
    }

    /// Take a token without waiting.
    pub async fn try_acquire(&self) -> bool {
        let mut st = self.state.lock().await;
        Self::try_take_locked(&self.cfg, &mut st).is_zero()
    }

    fn extend_block_locked(st: &mut State, backoff: Duration) {
        let until = Instant::now() + backoff;
        if st.blocked_until.map_or(true, |current| current < until) {
            st.blocked_until = Some(until);
        }
    }

    /// Hold back all dispatch for `backoff`. Longer existing blocks are kept.
    pub async fn block_for(&self, backoff: Duration) {
        let mut st = self.state.lock().await;
        Self::extend_block_locked(&mut st, backoff);
    }

    /// Record the request budget the provider reported with a response.
    ///
    /// An exhausted budget holds dispatch back until `reset_after` (one second when absent).
    /// A positive budget never lifts a block set by a throttling response.
    pub async fn update_budget(&self, remaining: u64, reset_after: Option<Duration>) {
        let mut st = self.state.lock().await;
        st.remaining = Some(remaining);
        if remaining == 0 {
            Self::extend_block_locked(&mut st, reset_after.unwrap_or(Duration::from_secs(1)));
        }
    }

    pub async fn snapshot(&self) -> RateLimiterSnapshot {
        let cfg = &self.cfg;
        let mut st = self.state.lock().await;
        let now = Instant::now();

        let mut wait_ms = st
            .blocked_until
            .filter(|until| *until > now)
            .map(|until| (until - now).as_millis() as u64);

        if cfg.rps > 0.0 {
            Self::refill_locked(cfg, &mut st, now);
            if st.tokens < 1.0 {
                let local_wait_ms = ((1.0 - st.tokens) / cfg.rps * 1000.0) as u64;
                wait_ms = Some(wait_ms.unwrap_or(0).max(local_wait_ms));
            }
        }

        RateLimiterSnapshot {
            rps: cfg.rps,
            burst: cfg.burst,
            tokens: st.tokens,
            estimated_wait_ms: wait_ms,
            remaining_budget: st.remaining,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_from_rps() {
        let config = RateLimiterConfig::from_rps(0.5).unwrap();
        assert_eq!(config.rps, 0.5);
        assert_eq!(config.burst, 1.0);
        assert!(RateLimiterConfig::from_rps(-1.0).is_none());
        assert!(RateLimiterConfig::from_rps(f64::NAN).is_none());
        assert!(RateLimiterConfig::from_rps(f64::INFINITY).is_none());
    }

    #[tokio::test]
    async fn unlimited_never_waits() {
        let limiter = RateLimiter::new(RateLimiterConfig::unlimited());
        for _ in 0..100 {
            assert!(limiter.try_acquire().await);
        }
        assert_eq!(limiter.snapshot().await.estimated_wait_ms, None);
    }

    #[tokio::test]
    async fn burst_then_empty() {
        let limiter = RateLimiter::new(
            RateLimiterConfig::from_rps(1.0).unwrap().with_burst(3),
        );
        assert!(limiter.try_acquire().await);
        assert!(limiter.try_acquire().await);
        assert!(limiter.try_acquire().await);
        assert!(!limiter.try_acquire().await);
        assert!(limiter.snapshot().await.estimated_wait_ms.is_some());
    }

    #[tokio::test]
    async fn refills_over_time() {
        let limiter = RateLimiter::new(
            RateLimiterConfig::from_rps(100.0).unwrap().with_burst(2),
        );
        assert!(limiter.try_acquire().await);
        assert!(limiter.try_acquire().await);
        assert!(!limiter.try_acquire().await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(limiter.try_acquire().await);
    }

    #[tokio::test]
    async fn provider_block_applies_to_unlimited_bucket() {
        let limiter = RateLimiter::new(RateLimiterConfig::unlimited());
        limiter.block_for(Duration::from_millis(40)).await;
        assert!(!limiter.try_acquire().await);
        assert!(limiter.snapshot().await.estimated_wait_ms.unwrap() > 0);

        let start = std::time::Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn shorter_block_does_not_shorten_existing_one() {
        let limiter = RateLimiter::new(RateLimiterConfig::unlimited());
        limiter.block_for(Duration::from_secs(5)).await;
        limiter.block_for(Duration::from_millis(1)).await;
        let wait = limiter.snapshot().await.estimated_wait_ms.unwrap();
        assert!(wait > 1_000);
    }

    #[tokio::test]
    async fn exhausted_budget_blocks_until_reset() {
        let limiter = RateLimiter::new(RateLimiterConfig::unlimited());
        limiter.update_budget(4, None).await;
        assert!(limiter.try_acquire().await);
        assert_eq!(limiter.snapshot().await.remaining_budget, Some(4));

        limiter
            .update_budget(0, Some(Duration::from_millis(50)))
            .await;
        assert!(!limiter.try_acquire().await);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(limiter.try_acquire().await);
    }

    #[tokio::test]
    async fn positive_budget_keeps_throttle_block() {
        let limiter = RateLimiter::new(RateLimiterConfig::unlimited());
        limiter.block_for(Duration::from_secs(5)).await;
        limiter.update_budget(10, None).await;
        assert!(!limiter.try_acquire().await);
    }
}
