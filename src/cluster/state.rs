//! Cluster state shared by every route forwarding to a cluster.

use std::fmt;
use std::sync::{Arc, Mutex};
use arc_swap::ArcSwap;

use crate::cluster::destination::DestinationState;
use crate::config::{AvailableDestinationsMode, ClusterConfig, HealthCheckConfig};
use crate::load_balancer::registry::{self, PolicyError};
use crate::load_balancer::LoadBalancingPolicy;
use crate::resolver::ResolverState;

/// Live state of one cluster.
pub struct ClusterState {
    id: Arc<str>,
    config: ClusterConfig,
    policy: Arc<dyn LoadBalancingPolicy>,
    /// Latest resolver snapshot.
    destinations: ArcSwap<ResolverState>,
    /// Filtered view of `destinations`, recomputed on every change.
    available: ArcSwap<Vec<Arc<DestinationState>>>,
    /// Serializes recompute-and-publish.
    update_lock: Mutex<()>,
}

impl ClusterState {
    /// Create an unresolved cluster using `policy`.
    pub fn new(config: ClusterConfig, policy: Arc<dyn LoadBalancingPolicy>) -> Arc<Self> {
        Arc::new(Self {
            id: Arc::from(config.name.as_str()),
            config,
            policy,
            destinations: ArcSwap::from_pointee(ResolverState::empty()),
            available: ArcSwap::from_pointee(Vec::new()),
            update_lock: Mutex::new(()),
        })
    }

    /// Create an unresolved cluster, resolving its policy by name.
    pub fn from_config(config: ClusterConfig) -> Result<Arc<Self>, PolicyError> {
        let policy = registry::build_policy(&config)?;
        Ok(Self::new(config, policy))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn id_arc(&self) -> Arc<str> {
        self.id.clone()
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn health_check(&self) -> &HealthCheckConfig {
        &self.config.health_check
    }

    pub fn policy(&self) -> &Arc<dyn LoadBalancingPolicy> {
        &self.policy
    }

    /// Current resolver snapshot.
    pub fn destinations(&self) -> Arc<ResolverState> {
        self.destinations.load_full()
    }

    /// Current available-destinations snapshot (single reference read).
    pub fn available_destinations(&self) -> Arc<Vec<Arc<DestinationState>>> {
        self.available.load_full()
    }

    /// Publish a new resolver snapshot and recompute availability.
    pub fn replace_destinations(&self, state: Arc<ResolverState>) {
        let _guard = self.lock();
        self.destinations.store(state);
        self.recompute();
    }

    /// Atomically derive a new snapshot from the current one.
    ///
    /// `update` returns `None` to leave the snapshot untouched. Returns true
    /// when a new snapshot was published.
    pub fn update_destinations<F>(&self, update: F) -> bool
    where
        F: FnOnce(&Arc<ResolverState>) -> Option<Arc<ResolverState>>,
    {
        let _guard = self.lock();
        let current = self.destinations.load_full();
        match update(&current) {
            Some(next) => {
                self.destinations.store(next);
                self.recompute();
                true
            }
            None => false,
        }
    }

    /// Recompute the available-destinations snapshot after a health change.
    pub fn update_available(&self) {
        let _guard = self.lock();
        self.recompute();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.update_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // Caller holds `update_lock`.
    fn recompute(&self) {
        let snapshot = self.destinations.load();
        let mut available: Vec<_> = snapshot.iter().filter(|d| d.is_available()).cloned().collect();

        if available.is_empty()
            && self.config.available_destinations == AvailableDestinationsMode::HealthyOrPanic
        {
            available = snapshot.iter().cloned().collect();
        }

        tracing::debug!(
            cluster = %self.id,
            total = snapshot.len(),
            available = available.len(),
            "Available destinations updated"
        );
        self.available.store(Arc::new(available));
    }
}

impl fmt::Debug for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterState")
            .field("id", &self.id)
            .field("policy", &self.policy.name())
            .field("destinations", &self.destinations.load().len())
            .field("available", &self.available.load().len())
            .finish()
    }
}
