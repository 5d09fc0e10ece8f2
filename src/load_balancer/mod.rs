//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Route matched → cluster identified
//!     → cluster.available_destinations() (health filtered snapshot)
//!     → cluster.policy() (resolved from registry at config time):
//!         - random.rs (uniform pick)
//!         - round_robin.rs (per-route rotation)
//!         - least_requests.rs (fewest in-flight requests)
//!         - power_of_two.rs (best of two random picks)
//!         - hash.rs (header/cookie/item keyed)
//!         - affinity.rs (sticky decorator over any of the above)
//!     → Return destination or None
//! ```
//!
//! # Design Decisions
//! - Policies never see unavailable destinations; filtering happens once per
//!   health change, not per pick
//! - Policies are shared across routes; per-route state lives in side tables
//!   that are evicted when routes go away
//! - Unknown policy names are rejected during validation, never at pick time

use std::fmt::Debug;
use std::sync::Arc;

use crate::cluster::{ClusterState, DestinationState};

pub mod affinity;
pub mod context;
pub mod hash;
pub mod least_requests;
pub mod power_of_two;
pub mod random;
pub mod registry;
pub mod round_robin;

pub use context::RequestContext;

/// Chooses one destination out of the currently available set.
pub trait LoadBalancingPolicy: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    /// Returns `None` only when `available` is empty.
    fn pick(
        &self,
        ctx: &mut RequestContext,
        available: &[Arc<DestinationState>],
    ) -> Option<Arc<DestinationState>>;

    /// Drop per-route state for a removed route.
    fn evict_route(&self, _route_id: &str) {}
}

/// Pick a destination from `cluster` for this request.
pub fn pick_destination(
    ctx: &mut RequestContext,
    cluster: &ClusterState,
) -> Option<Arc<DestinationState>> {
    let available = cluster.available_destinations();
    if available.is_empty() {
        return None;
    }
    cluster.policy().pick(ctx, &available)
}
