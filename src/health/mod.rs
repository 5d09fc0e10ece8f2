//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks (active.rs):
//!     Per-cluster timer
//!     → probe.rs (Connect / Http probe per destination, concurrently)
//!     → state.rs (consecutive pass/fail thresholds)
//!     → ClusterState::update_available()
//!
//! Passive health checks (passive.rs):
//!     Dispatch loop reports outcome
//!     → state.rs (sliding failure-rate window)
//!     → Unhealthy if rate >= limit → reactivation timer → Unknown
//!     → ClusterState::update_available() (spawned)
//! ```
//!
//! # Design Decisions
//! - Active and passive checks are complementary and share one health field
//! - Three states: Unknown re-admits a destination without claiming it is healthy
//! - Health history is per-destination, locked per destination

pub mod active;
pub mod passive;
pub mod probe;
pub mod state;

use std::sync::Arc;

use crate::cluster::DestinationState;

pub use active::ActiveHealthMonitor;
pub use passive::PassiveHealthReporter;
pub use probe::{ActiveHealthProbe, ProbeError, ProbeRegistry};

/// Receives real traffic outcomes from the dispatch loops.
pub trait HealthReporter: Send + Sync {
    /// An attempt failed for a reason attributable to the destination.
    fn report_failure(&self, destination: &Arc<DestinationState>);

    /// An attempt completed successfully.
    fn report_success(&self, destination: &Arc<DestinationState>);
}
