//! Resolver snapshots.
//!
//! # Kinds
//! - Static: literal `ip:port` destinations, never refreshed
//! - Dynamic: produced by a named resolver (DNS), rebuilt on refresh
//! - Union: concatenation of other snapshots, indexed without copying

use std::net::SocketAddr;
use std::sync::Arc;

use crate::cluster::DestinationState;
use crate::config::DestinationConfig;

/// Output of one dynamic resolver pass.
#[derive(Debug)]
pub struct DynamicState {
    /// Index of the producing resolver in the manager's priority list.
    pub resolver: usize,
    /// Entries this resolver claimed; replayed on refresh.
    pub configs: Vec<DestinationConfig>,
    pub destinations: Vec<Arc<DestinationState>>,
}

/// A point-in-time, read-only set of destinations for a cluster.
#[derive(Debug)]
pub enum ResolverState {
    Static(Vec<Arc<DestinationState>>),
    Dynamic(DynamicState),
    Union(Vec<Arc<ResolverState>>),
}

impl ResolverState {
    /// Snapshot of an unresolved cluster.
    pub fn empty() -> Self {
        ResolverState::Static(Vec::new())
    }

    /// Static snapshot over the given destinations.
    pub fn fixed(destinations: Vec<Arc<DestinationState>>) -> Self {
        ResolverState::Static(destinations)
    }

    /// Merge several snapshots; a single part is returned as-is.
    pub fn union(mut parts: Vec<Arc<ResolverState>>) -> Arc<Self> {
        if parts.len() == 1 {
            return parts.remove(0);
        }
        Arc::new(ResolverState::Union(parts))
    }

    pub fn len(&self) -> usize {
        match self {
            ResolverState::Static(d) => d.len(),
            ResolverState::Dynamic(s) => s.destinations.len(),
            ResolverState::Union(parts) => parts.iter().map(|p| p.len()).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destination at `index` in concatenation order.
    pub fn get(&self, index: usize) -> Option<&Arc<DestinationState>> {
        match self {
            ResolverState::Static(d) => d.get(index),
            ResolverState::Dynamic(s) => s.destinations.get(index),
            ResolverState::Union(parts) => {
                let mut index = index;
                for part in parts {
                    let len = part.len();
                    if index < len {
                        return part.get(index);
                    }
                    index -= len;
                }
                None
            }
        }
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = &Arc<DestinationState>> + '_> {
        match self {
            ResolverState::Static(d) => Box::new(d.iter()),
            ResolverState::Dynamic(s) => Box::new(s.destinations.iter()),
            ResolverState::Union(parts) => Box::new(parts.iter().flat_map(|p| p.iter())),
        }
    }

    /// Top-level parts: the union's members, or the snapshot itself.
    pub fn parts(self: &Arc<Self>) -> Vec<Arc<ResolverState>> {
        match self.as_ref() {
            ResolverState::Union(parts) => parts.clone(),
            _ => vec![self.clone()],
        }
    }

    /// Existing destination for `endpoint`, if any.
    pub fn find(&self, endpoint: SocketAddr) -> Option<&Arc<DestinationState>> {
        self.iter().find(|d| d.endpoint() == endpoint)
    }

    /// Sorted endpoint list, for structural comparison.
    pub fn endpoints(&self) -> Vec<SocketAddr> {
        let mut endpoints: Vec<_> = self.iter().map(|d| d.endpoint()).collect();
        endpoints.sort_unstable();
        endpoints
    }
}

/// True when both lists name the same endpoints, ignoring order.
pub fn same_endpoints(previous: &[Arc<DestinationState>], next: &[SocketAddr]) -> bool {
    if previous.len() != next.len() {
        return false;
    }
    let mut a: Vec<_> = previous.iter().map(|d| d.endpoint()).collect();
    let mut b = next.to_vec();
    a.sort_unstable();
    b.sort_unstable();
    a == b
}
