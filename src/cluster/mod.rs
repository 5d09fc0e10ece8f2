//! Destination and cluster model.
//!
//! # Data Flow
//! ```text
//! ClusterConfig
//!     → state.rs (ClusterState: policy, resolver snapshot, available snapshot)
//!     → resolver publishes ResolverState
//!     → destination.rs (DestinationState per endpoint)
//!     → health changes → ClusterState::update_available()
//!     → load balancer reads available snapshot
//! ```
//!
//! # Design Decisions
//! - Snapshots are replaced whole through `ArcSwap`; readers never see a partial list
//! - One short lock per cluster serializes "recompute and publish"
//! - Destinations point back at their cluster with a `Weak`

pub mod state;
pub mod destination;

pub use state::ClusterState;
pub use destination::{ConcurrencyGuard, DestinationState, HealthState};
