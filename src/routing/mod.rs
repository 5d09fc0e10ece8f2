//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (host, path)
//!     → router.rs (route lookup)
//!     → matcher.rs (evaluate match conditions)
//!     → Return: matched RouteState or None
//!
//! Route Compilation (at startup and on reload):
//!     RouteConfig[]
//!     → Build RouteState (cluster, timeout, retries, limiter)
//!     → Sort by priority
//!     → Freeze as immutable Router
//! ```
//!
//! # Design Decisions
//! - Routes compiled once per configuration, immutable at runtime
//! - No regex in hot path (prefix matching only)
//! - Deterministic: same input always matches same route
//! - TCP and UDP listeners serve their single highest priority route

pub mod matcher;
pub mod router;

pub use router::{RouteState, Router};
