//! Active health checking.
//!
//! # Responsibilities
//! - Schedule one periodic probing task per cluster with an active config
//! - Probe every destination of a cluster concurrently, each bounded by a timeout
//! - Apply consecutive pass/fail thresholds and recompute availability

use dashmap::DashMap;
use futures_util::future::join_all;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::cluster::ClusterState;
use crate::health::probe::{ProbeError, ProbeRegistry};
use crate::lifecycle::Shutdown;
use crate::observability::metrics;

/// Periodically probes destinations out-of-band.
pub struct ActiveHealthMonitor {
    probes: ProbeRegistry,
    schedules: DashMap<Arc<str>, JoinHandle<()>>,
    shutdown: Shutdown,
}

impl ActiveHealthMonitor {
    pub fn new(probes: ProbeRegistry, shutdown: Shutdown) -> Arc<Self> {
        Arc::new(Self {
            probes,
            schedules: DashMap::new(),
            shutdown,
        })
    }

    /// Schedule probing for every cluster that declares an active check.
    pub fn check_health(self: &Arc<Self>, clusters: &[Arc<ClusterState>]) {
        for cluster in clusters {
            if cluster.health_check().active.is_some() {
                self.schedule(cluster);
            }
        }
    }

    /// Start (or restart) probing `cluster` at its configured interval.
    pub fn schedule(self: &Arc<Self>, cluster: &Arc<ClusterState>) {
        let Some(active) = cluster.health_check().active.clone() else {
            return;
        };

        let weak: Weak<ClusterState> = Arc::downgrade(cluster);
        let monitor = Arc::downgrade(self);
        let mut shutdown = self.shutdown.subscribe();
        let id = cluster.id_arc();
        let task_id = id.clone();

        tracing::info!(
            cluster = %id,
            policy = %active.policy,
            interval_ms = active.interval_ms,
            "Active health checks scheduled"
        );

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(active.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.recv() => {
                        tracing::debug!(cluster = %task_id, "Health monitor received shutdown signal");
                        break;
                    }
                }

                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                let Some(cluster) = weak.upgrade() else {
                    monitor.forget(&task_id, tokio::task::id());
                    break;
                };

                let round = AssertUnwindSafe(monitor.probe_cluster(&cluster)).catch_unwind();
                if round.await.is_err() {
                    tracing::error!(cluster = %task_id, "Health probe round panicked, retrying next interval");
                }
            }
        });

        if let Some(previous) = self.schedules.insert(id, handle) {
            previous.abort();
        }
    }

    /// Stop probing a cluster removed from configuration.
    pub fn unschedule(&self, cluster_id: &str) {
        if let Some((_, handle)) = self.schedules.remove(cluster_id) {
            handle.abort();
            tracing::info!(cluster = %cluster_id, "Active health checks unscheduled");
        }
    }

    /// Drop the schedule entry of a task whose cluster is gone, unless a
    /// newer task has replaced it.
    fn forget(&self, cluster_id: &str, task: tokio::task::Id) {
        if self.schedules.remove_if(cluster_id, |_, handle| handle.id() == task).is_some() {
            tracing::debug!(cluster = %cluster_id, "Cluster dropped, health checks stopped");
        }
    }

    pub fn is_scheduled(&self, cluster_id: &str) -> bool {
        self.schedules.contains_key(cluster_id)
    }

    /// Run one probing round for `cluster`.
    pub async fn probe_cluster(&self, cluster: &ClusterState) {
        let Some(active) = cluster.health_check().active.as_ref() else {
            return;
        };
        let Some(probe) = self.probes.get(&active.policy) else {
            tracing::warn!(cluster = %cluster.id(), policy = %active.policy, "Unknown health probe policy");
            return;
        };

        let snapshot = cluster.destinations();
        let timeout = active.timeout();
        let rounds = snapshot.iter().map(|destination| {
            let probe = probe.clone();
            async move {
                let result = match time::timeout(timeout, probe.probe(destination, active)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProbeError::Timeout),
                };
                (destination, result)
            }
        });

        for (destination, result) in join_all(rounds).await {
            if let Err(e) = &result {
                tracing::debug!(
                    cluster = %cluster.id(),
                    destination = %destination.endpoint(),
                    error = %e,
                    "Health probe failed"
                );
            }

            let mut history = destination.history();
            let next = history
                .active
                .observe(result.is_ok(), active.passes, active.fails);
            if let Some(state) = next {
                if destination.set_health(state) {
                    tracing::info!(
                        cluster = %cluster.id(),
                        destination = %destination.endpoint(),
                        health = %state,
                        "Destination health changed by active probe"
                    );
                    metrics::record_destination_health(cluster.id(), destination.endpoint(), state);
                }
            }
        }

        cluster.update_available();
    }
}

impl Drop for ActiveHealthMonitor {
    fn drop(&mut self) {
        for entry in self.schedules.iter() {
            entry.value().abort();
        }
    }
}
