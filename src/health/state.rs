//! Per-destination health history.
//!
//! # States
//! - Healthy: confirmed by active probes
//! - Unknown: not yet confirmed, still receives traffic
//! - Unhealthy: excluded from load balancing
//!
//! # State Transitions
//! ```text
//! active:  consecutive fails  >= fails  → Unhealthy (counters reset)
//!          consecutive passes >= passes → Healthy   (counters reset)
//! passive: failure rate >= limit with enough samples → Unhealthy
//!          reactivation period elapsed                → Unknown
//! ```

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use crate::cluster::HealthState;

/// Buckets kept per detection window.
const BUCKETS_PER_WINDOW: u32 = 10;

/// Everything health trackers remember about one destination.
#[derive(Debug, Default)]
pub struct HealthHistory {
    pub active: ActiveHistory,
    pub passive: PassiveHistory,
}

/// Consecutive probe outcomes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ActiveHistory {
    pub passes: u32,
    pub fails: u32,
}

impl ActiveHistory {
    /// Record one probe outcome.
    ///
    /// Returns the state to move to when a threshold is crossed; both
    /// counters are reset at that point.
    pub fn observe(&mut self, passed: bool, passes: u32, fails: u32) -> Option<HealthState> {
        if passed {
            self.fails = 0;
            self.passes += 1;
            if self.passes >= passes {
                *self = Self::default();
                return Some(HealthState::Healthy);
            }
        } else {
            self.passes = 0;
            self.fails += 1;
            if self.fails >= fails {
                *self = Self::default();
                return Some(HealthState::Unhealthy);
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    start: Instant,
    total: u64,
    failed: u64,
}

/// Sliding window of request outcomes.
#[derive(Debug, Default)]
pub struct PassiveHistory {
    buckets: VecDeque<Bucket>,
    /// Bumped on every deactivation; reactivation timers compare against it.
    generation: u64,
}

impl PassiveHistory {
    /// Record one outcome and return `(total, failed)` inside the window.
    pub fn record(&mut self, now: Instant, failed: bool, window: Duration) -> (u64, u64) {
        let granularity = (window / BUCKETS_PER_WINDOW).max(Duration::from_millis(1));

        while let Some(front) = self.buckets.front() {
            if now.saturating_duration_since(front.start) >= window {
                self.buckets.pop_front();
            } else {
                break;
            }
        }

        match self.buckets.back_mut() {
            Some(bucket) if now.saturating_duration_since(bucket.start) < granularity => {
                bucket.total += 1;
                bucket.failed += u64::from(failed);
            }
            _ => self.buckets.push_back(Bucket {
                start: now,
                total: 1,
                failed: u64::from(failed),
            }),
        }

        self.totals()
    }

    /// `(total, failed)` across the retained buckets.
    pub fn totals(&self) -> (u64, u64) {
        self.buckets
            .iter()
            .fold((0, 0), |(t, f), b| (t + b.total, f + b.failed))
    }

    /// Forget all samples and start a new generation.
    pub fn reset(&mut self) -> u64 {
        self.buckets.clear();
        self.generation += 1;
        self.generation
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}
