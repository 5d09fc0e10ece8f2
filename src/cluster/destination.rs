//! Destination abstraction.
//!
//! # Responsibilities
//! - Represent a single backend endpoint of a cluster
//! - Track outstanding requests (for LeastRequests / PowerOfTwoChoices)
//! - Track health state (Healthy/Unhealthy/Unknown)
//! - Hold the per-destination health history behind its own lock

use std::fmt;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::cluster::ClusterState;
use crate::health::state::HealthHistory;

/// Health State enum.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthState {
    Unknown = 0,
    Healthy = 1,
    Unhealthy = 2,
}

impl From<u8> for HealthState {
    fn from(val: u8) -> Self {
        match val {
            1 => HealthState::Healthy,
            2 => HealthState::Unhealthy,
            _ => HealthState::Unknown,
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthState::Unknown => "unknown",
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// A single backend endpoint and its live state.
pub struct DestinationState {
    /// Resolved network endpoint.
    endpoint: SocketAddr,
    /// Host to present upstream (the configured hostname for resolved entries).
    host: Option<String>,
    /// Owning cluster. Non-owning: the cluster owns its snapshots.
    cluster: Weak<ClusterState>,
    cluster_id: Arc<str>,
    /// Current health state, stored as `HealthState as u8`.
    health: AtomicU8,
    /// Outstanding requests/connections.
    concurrency: AtomicUsize,
    history: Mutex<HealthHistory>,
}

impl DestinationState {
    /// Create a destination belonging to `cluster`.
    pub fn new(endpoint: SocketAddr, host: Option<String>, cluster: &Arc<ClusterState>) -> Self {
        Self::with_parts(endpoint, host, Arc::downgrade(cluster), cluster.id_arc())
    }

    /// Create a destination with no owning cluster.
    ///
    /// Health flips on such a destination never trigger a cluster recompute.
    pub fn detached(endpoint: SocketAddr) -> Self {
        Self::with_parts(endpoint, None, Weak::new(), Arc::from(""))
    }

    fn with_parts(
        endpoint: SocketAddr,
        host: Option<String>,
        cluster: Weak<ClusterState>,
        cluster_id: Arc<str>,
    ) -> Self {
        Self {
            endpoint,
            host,
            cluster,
            cluster_id,
            health: AtomicU8::new(HealthState::Unknown as u8),
            concurrency: AtomicUsize::new(0),
            history: Mutex::new(HealthHistory::default()),
        }
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// The owning cluster, if it is still alive.
    pub fn cluster(&self) -> Option<Arc<ClusterState>> {
        self.cluster.upgrade()
    }

    pub fn health(&self) -> HealthState {
        HealthState::from(self.health.load(Ordering::Acquire))
    }

    /// Set the health state. Returns true if it changed.
    pub fn set_health(&self, state: HealthState) -> bool {
        let previous = self.health.swap(state as u8, Ordering::AcqRel);
        previous != state as u8
    }

    /// Healthy or Unknown destinations may receive traffic.
    pub fn is_available(&self) -> bool {
        self.health() != HealthState::Unhealthy
    }

    /// Number of outstanding requests.
    pub fn concurrency(&self) -> usize {
        self.concurrency.load(Ordering::Relaxed)
    }

    /// Count one outstanding request until the guard is dropped.
    pub fn track(self: &Arc<Self>) -> ConcurrencyGuard {
        self.concurrency.fetch_add(1, Ordering::Relaxed);
        ConcurrencyGuard {
            destination: self.clone(),
        }
    }

    /// Lock this destination's health history.
    pub fn history(&self) -> MutexGuard<'_, HealthHistory> {
        self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for DestinationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationState")
            .field("endpoint", &self.endpoint)
            .field("cluster", &self.cluster_id)
            .field("health", &self.health())
            .field("concurrency", &self.concurrency())
            .finish()
    }
}

/// A RAII guard that manages the outstanding request count.
#[derive(Debug)]
pub struct ConcurrencyGuard {
    destination: Arc<DestinationState>,
}

impl ConcurrencyGuard {
    pub fn destination(&self) -> &Arc<DestinationState> {
        &self.destination
    }
}

impl Deref for ConcurrencyGuard {
    type Target = DestinationState;
    fn deref(&self) -> &Self::Target {
        &self.destination
    }
}

impl Drop for ConcurrencyGuard {
    fn drop(&mut self) {
        self.destination.concurrency.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_tracks_concurrency() {
        let dest = Arc::new(DestinationState::detached("127.0.0.1:8080".parse().unwrap()));
        let g1 = dest.track();
        let g2 = dest.track();
        assert_eq!(dest.concurrency(), 2);
        drop(g1);
        assert_eq!(dest.concurrency(), 1);
        drop(g2);
        assert_eq!(dest.concurrency(), 0);
    }

    #[test]
    fn health_transitions_report_change() {
        let dest = DestinationState::detached("127.0.0.1:8080".parse().unwrap());
        assert_eq!(dest.health(), HealthState::Unknown);
        assert!(dest.is_available());
        assert!(dest.set_health(HealthState::Unhealthy));
        assert!(!dest.set_health(HealthState::Unhealthy));
        assert!(!dest.is_available());
    }
}
