//! Destination resolution subsystem.
//!
//! # Data Flow
//! ```text
//! ClusterConfig.destinations
//!     → manager.rs (split literal vs. resolvable entries)
//!         - literal ip:port → static snapshot
//!         - hostname:port   → dns.rs (one endpoint per resolved IP)
//!     → state.rs (Static / Dynamic / Union snapshot)
//!     → ClusterState::replace_destinations()
//!
//! Refresh (optional, per cluster):
//!     timer → re-run dynamic resolvers → compare endpoint sets
//!         - unchanged → no publish (snapshot identity kept)
//!         - changed   → publish new union → availability recomputed
//! ```
//!
//! # Design Decisions
//! - Snapshots are never mutated; every change is a new snapshot
//! - Endpoints surviving a refresh keep their DestinationState (health, counters)
//! - Refresh tasks are unscheduled explicitly when a cluster is removed

pub mod dns;
pub mod manager;
pub mod state;

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

use crate::cluster::ClusterState;
use crate::config::DestinationConfig;

pub use dns::{DnsResolver, HostLookup, SystemLookup};
pub use manager::DestinationResolverManager;
pub use state::ResolverState;

/// One endpoint produced by a resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    pub endpoint: SocketAddr,
    /// Host header to present upstream.
    pub host: Option<String>,
}

/// Errors produced while resolving destinations.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("lookup of '{host}' failed: {source}")]
    Lookup {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{host}' resolved to no addresses")]
    NoAddresses { host: String },

    #[error("invalid destination address '{address}'")]
    InvalidAddress { address: String },

    #[error("no resolver claims destination '{address}'")]
    Unclaimed { address: String },
}

/// A source of destinations for entries that are not literal endpoints.
#[async_trait]
pub trait DestinationResolver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Resolvers with a lower order claim entries first.
    fn order(&self) -> i32;

    /// Whether this resolver handles `config`.
    fn claims(&self, config: &DestinationConfig) -> bool;

    /// Resolve the claimed entries of `cluster`.
    async fn resolve(
        &self,
        cluster: &Arc<ClusterState>,
        configs: &[DestinationConfig],
    ) -> Result<Vec<ResolvedEndpoint>, ResolveError>;
}
