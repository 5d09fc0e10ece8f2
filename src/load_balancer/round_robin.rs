//! Round-robin load balancing strategy.

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::cluster::DestinationState;
use crate::load_balancer::{LoadBalancingPolicy, RequestContext};

/// Round-robin selector.
///
/// Counters live in a side table keyed by route id, so routes sharing a
/// cluster rotate independently. Entries are evicted when a route is removed.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counters: DashMap<Arc<str>, AtomicUsize>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    fn next(&self, route_id: &str) -> usize {
        if let Some(counter) = self.counters.get(route_id) {
            return counter.fetch_add(1, Ordering::Relaxed);
        }
        self.counters
            .entry(Arc::from(route_id))
            .or_default()
            .fetch_add(1, Ordering::Relaxed)
    }

    pub fn tracked_routes(&self) -> usize {
        self.counters.len()
    }
}

impl LoadBalancingPolicy for RoundRobin {
    fn name(&self) -> &'static str {
        "RoundRobin"
    }

    fn pick(
        &self,
        ctx: &mut RequestContext,
        available: &[Arc<DestinationState>],
    ) -> Option<Arc<DestinationState>> {
        if available.is_empty() {
            return None;
        }
        // Counter wraps; mask keeps the index in the non-negative half.
        let count = self.next(ctx.route_id()) & (usize::MAX >> 1);
        available.get(count % available.len()).cloned()
    }

    fn evict_route(&self, route_id: &str) {
        self.counters.remove(route_id);
    }
}
