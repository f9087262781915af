use super::task::LaneKind;
use crate::resilience::rate_limiter::RateLimiterSnapshot;
use serde::Serialize;

/// Point-in-time view of one lane. Facts only; callers decide what to do with them.
#[derive(Debug, Clone, Serialize)]
pub struct LaneSnapshot {
    pub lane: LaneKind,
    pub max_in_flight: usize,
    pub in_flight: usize,
    /// Highest in-flight count observed since the lane was created.
    pub peak_in_flight: usize,
    pub queued: usize,
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub timed_out: u64,
    pub rate_limiter: RateLimiterSnapshot,
}

impl LaneSnapshot {
    pub fn available(&self) -> usize {
        self.max_in_flight.saturating_sub(self.in_flight)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ThrottlerSignals {
    pub read: LaneSnapshot,
    pub action: LaneSnapshot,
}

impl ThrottlerSignals {
    pub fn lane(&self, kind: LaneKind) -> &LaneSnapshot {
        match kind {
            LaneKind::Read => &self.read,
            LaneKind::Action => &self.action,
        }
    }
}
