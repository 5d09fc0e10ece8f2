//! Passive health checking (failure rate detection).
//!
//! # Responsibilities
//! - Observe real request outcomes reported by the dispatch loops
//! - Keep a sliding failure-rate window per destination
//! - Deactivate destinations whose failure rate crosses the limit
//! - Reactivate them (as Unknown) after the cool-down
//!
//! # Design Decisions
//! - Only the destination's own history lock is taken; reports for different
//!   destinations never contend
//! - Availability recompute runs on a spawned task so reporting never waits on it
//! - Reactivation is stamped with a generation so stale timers are ignored

use std::sync::Arc;
use tokio::time::Instant;

use crate::cluster::{ClusterState, DestinationState, HealthState};
use crate::health::HealthReporter;
use crate::observability::metrics;

/// Passive health reporter driven by request outcomes.
#[derive(Debug, Default, Clone)]
pub struct PassiveHealthReporter;

impl PassiveHealthReporter {
    pub fn new() -> Self {
        Self
    }

    fn report(&self, destination: &Arc<DestinationState>, failed: bool) {
        let Some(cluster) = destination.cluster() else {
            return;
        };
        let Some(passive) = cluster.health_check().passive.as_ref() else {
            return;
        };

        let mut history = destination.history();
        let (total, failures) = history
            .passive
            .record(Instant::now(), failed, passive.detection_window());

        if !failed || total < passive.minimal_total_count_threshold.max(1) {
            return;
        }
        let rate = failures as f64 / total as f64;
        if rate < passive.failure_rate_limit || destination.health() == HealthState::Unhealthy {
            return;
        }

        let generation = history.passive.reset();
        destination.set_health(HealthState::Unhealthy);
        drop(history);

        tracing::warn!(
            cluster = %cluster.id(),
            destination = %destination.endpoint(),
            failure_rate = rate,
            samples = total,
            reactivation_ms = passive.reactivation_period_ms,
            "Destination deactivated by passive health check"
        );
        metrics::record_destination_health(cluster.id(), destination.endpoint(), HealthState::Unhealthy);

        schedule_reactivation(destination.clone(), generation, passive.reactivation_period());
        schedule_update(cluster);
    }
}

impl HealthReporter for PassiveHealthReporter {
    fn report_failure(&self, destination: &Arc<DestinationState>) {
        self.report(destination, true);
    }

    fn report_success(&self, destination: &Arc<DestinationState>) {
        self.report(destination, false);
    }
}

fn schedule_update(cluster: Arc<ClusterState>) {
    tokio::spawn(async move {
        cluster.update_available();
    });
}

fn schedule_reactivation(destination: Arc<DestinationState>, generation: u64, period: std::time::Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(period).await;

        {
            let history = destination.history();
            if history.passive.generation() != generation
                || destination.health() != HealthState::Unhealthy
            {
                return;
            }
            destination.set_health(HealthState::Unknown);
        }

        tracing::info!(
            cluster = %destination.cluster_id(),
            destination = %destination.endpoint(),
            "Destination reactivated after passive cool-down"
        );
        metrics::record_destination_health(destination.cluster_id(), destination.endpoint(), HealthState::Unknown);

        if let Some(cluster) = destination.cluster() {
            cluster.update_available();
        }
    });
}
