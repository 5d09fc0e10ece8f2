//! Resolution orchestration and periodic refresh.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::cluster::{ClusterState, DestinationState};
use crate::config::DestinationConfig;
use crate::lifecycle::Shutdown;
use crate::resolver::state::{same_endpoints, DynamicState};
use crate::resolver::{
    DestinationResolver, DnsResolver, ResolveError, ResolvedEndpoint, ResolverState,
};

/// Turns destination configs into resolver snapshots and keeps them fresh.
pub struct DestinationResolverManager {
    /// Sorted by `order()`.
    resolvers: Vec<Arc<dyn DestinationResolver>>,
    refreshes: DashMap<Arc<str>, JoinHandle<()>>,
    shutdown: Shutdown,
}

impl DestinationResolverManager {
    pub fn new(mut resolvers: Vec<Arc<dyn DestinationResolver>>, shutdown: Shutdown) -> Self {
        resolvers.sort_by_key(|r| r.order());
        Self {
            resolvers,
            refreshes: DashMap::new(),
            shutdown,
        }
    }

    /// Manager with the system DNS resolver.
    pub fn with_dns(shutdown: Shutdown) -> Self {
        Self::new(vec![Arc::new(DnsResolver::system())], shutdown)
    }

    /// Resolve `configs` for `cluster` into a new snapshot.
    ///
    /// Literal `ip:port` entries bypass resolution. Destinations whose endpoint
    /// already exists in the cluster's current snapshot are reused.
    pub async fn resolve_destinations(
        &self,
        cluster: &Arc<ClusterState>,
        configs: &[DestinationConfig],
    ) -> Result<Arc<ResolverState>, ResolveError> {
        let previous = cluster.destinations();
        let mut remaining = Vec::new();
        let mut literal = Vec::new();

        for config in configs {
            match config.address.parse::<SocketAddr>() {
                Ok(endpoint) => literal.push(ResolvedEndpoint {
                    endpoint,
                    host: config.host.clone(),
                }),
                Err(_) => remaining.push(config.clone()),
            }
        }

        let mut parts = Vec::new();
        if !literal.is_empty() {
            let destinations = build_destinations(cluster, &previous, literal);
            parts.push(Arc::new(ResolverState::Static(destinations)));
        }

        for (index, resolver) in self.resolvers.iter().enumerate() {
            let (claimed, rest): (Vec<_>, Vec<_>) =
                remaining.into_iter().partition(|c| resolver.claims(c));
            remaining = rest;
            if claimed.is_empty() {
                continue;
            }

            let endpoints = resolver.resolve(cluster, &claimed).await?;
            parts.push(Arc::new(ResolverState::Dynamic(DynamicState {
                resolver: index,
                configs: claimed,
                destinations: build_destinations(cluster, &previous, endpoints),
            })));
        }

        if let Some(unclaimed) = remaining.first() {
            return Err(ResolveError::Unclaimed {
                address: unclaimed.address.clone(),
            });
        }

        if parts.is_empty() {
            return Ok(Arc::new(ResolverState::empty()));
        }
        Ok(ResolverState::union(parts))
    }

    /// Resolve the cluster's configured destinations, publish them and
    /// schedule refresh when configured.
    pub async fn initialize(self: &Arc<Self>, cluster: &Arc<ClusterState>) -> Result<(), ResolveError> {
        self.prepare(cluster).await?;
        self.activate(cluster);
        Ok(())
    }

    /// Resolve and publish the cluster's configured destinations without
    /// starting any background work.
    pub async fn prepare(&self, cluster: &Arc<ClusterState>) -> Result<(), ResolveError> {
        let state = self
            .resolve_destinations(cluster, &cluster.config().destinations)
            .await?;

        tracing::info!(
            cluster = %cluster.id(),
            destinations = state.len(),
            "Cluster destinations resolved"
        );
        cluster.replace_destinations(state);
        Ok(())
    }

    /// Schedule refresh for a prepared cluster with dynamic destinations.
    pub fn activate(self: &Arc<Self>, cluster: &Arc<ClusterState>) {
        let dynamic = cluster
            .destinations()
            .parts()
            .iter()
            .any(|p| matches!(p.as_ref(), ResolverState::Dynamic(_)));

        if let (true, Some(period)) = (dynamic, cluster.config().dns_refresh()) {
            self.schedule_refresh(cluster, period);
        }
    }

    /// Re-run the dynamic resolvers of `cluster`.
    ///
    /// Returns true when a changed snapshot was published; an unchanged
    /// endpoint set leaves the current snapshot in place.
    pub async fn refresh(&self, cluster: &Arc<ClusterState>) -> Result<bool, ResolveError> {
        let current = cluster.destinations();
        let mut parts = current.parts();
        let mut changed = false;

        for part in parts.iter_mut() {
            let ResolverState::Dynamic(dynamic) = part.as_ref() else {
                continue;
            };
            let Some(resolver) = self.resolvers.get(dynamic.resolver) else {
                continue;
            };

            let endpoints = resolver.resolve(cluster, &dynamic.configs).await?;
            let addrs: Vec<_> = endpoints.iter().map(|e| e.endpoint).collect();
            if same_endpoints(&dynamic.destinations, &addrs) {
                continue;
            }

            tracing::info!(
                cluster = %cluster.id(),
                resolver = resolver.name(),
                before = dynamic.destinations.len(),
                after = addrs.len(),
                "Resolved destinations changed"
            );
            *part = Arc::new(ResolverState::Dynamic(DynamicState {
                resolver: dynamic.resolver,
                configs: dynamic.configs.clone(),
                destinations: build_destinations(cluster, &current, endpoints),
            }));
            changed = true;
        }

        if !changed {
            return Ok(false);
        }

        let next = ResolverState::union(parts);
        // A concurrent publish wins; the next tick resolves against it.
        Ok(cluster.update_destinations(|latest| Arc::ptr_eq(latest, &current).then_some(next)))
    }

    /// Start (or restart) the periodic refresh of `cluster`.
    pub fn schedule_refresh(self: &Arc<Self>, cluster: &Arc<ClusterState>, period: Duration) {
        let weak: Weak<ClusterState> = Arc::downgrade(cluster);
        let manager = Arc::downgrade(self);
        let mut shutdown = self.shutdown.subscribe();
        let id = cluster.id_arc();
        let task_id = id.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {}
                    _ = shutdown.recv() => break,
                }

                let (Some(cluster), Some(manager)) = (weak.upgrade(), manager.upgrade()) else {
                    break;
                };
                if let Err(e) = manager.refresh(&cluster).await {
                    tracing::warn!(cluster = %task_id, error = %e, "Destination refresh failed, keeping previous snapshot");
                }
            }
            tracing::debug!(cluster = %task_id, "Destination refresh stopped");
        });

        if let Some(previous) = self.refreshes.insert(id, handle) {
            previous.abort();
        }
    }

    /// Stop refreshing a cluster removed from configuration.
    pub fn unschedule(&self, cluster_id: &str) {
        if let Some((_, handle)) = self.refreshes.remove(cluster_id) {
            handle.abort();
            tracing::debug!(cluster = %cluster_id, "Destination refresh unscheduled");
        }
    }

    pub fn is_scheduled(&self, cluster_id: &str) -> bool {
        self.refreshes.contains_key(cluster_id)
    }
}

impl Drop for DestinationResolverManager {
    fn drop(&mut self) {
        for entry in self.refreshes.iter() {
            entry.value().abort();
        }
    }
}

fn build_destinations(
    cluster: &Arc<ClusterState>,
    previous: &ResolverState,
    endpoints: Vec<ResolvedEndpoint>,
) -> Vec<Arc<DestinationState>> {
    endpoints
        .into_iter()
        .map(|e| match previous.find(e.endpoint) {
            Some(existing) if existing.host() == e.host.as_deref() => existing.clone(),
            _ => Arc::new(DestinationState::new(e.endpoint, e.host, cluster)),
        })
        .collect()
}
