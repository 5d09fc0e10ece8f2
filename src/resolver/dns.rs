//! DNS destination resolver.
//!
//! # Responsibilities
//! - Claim destinations written as `hostname:port`
//! - Look the hostname up and emit one endpoint per resolved IP
//! - Preserve the original hostname for the upstream Host header

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::cluster::ClusterState;
use crate::config::DestinationConfig;
use crate::resolver::{DestinationResolver, ResolveError, ResolvedEndpoint};

/// Name lookup used by the DNS resolver.
#[async_trait]
pub trait HostLookup: Send + Sync {
    async fn lookup(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>>;
}

/// System resolver via `tokio::net::lookup_host`.
#[derive(Debug, Default)]
pub struct SystemLookup;

#[async_trait]
impl HostLookup for SystemLookup {
    async fn lookup(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        Ok(tokio::net::lookup_host((host, port)).await?.collect())
    }
}

/// Resolves `hostname:port` destinations through DNS.
pub struct DnsResolver {
    lookup: Arc<dyn HostLookup>,
}

impl DnsResolver {
    pub fn new(lookup: Arc<dyn HostLookup>) -> Self {
        Self { lookup }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemLookup))
    }
}

/// Split "host:port"; bracketed IPv6 hosts are unwrapped.
pub(crate) fn split_host_port(address: &str) -> Option<(&str, u16)> {
    let (host, port) = address.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some((host, port))
}

#[async_trait]
impl DestinationResolver for DnsResolver {
    fn name(&self) -> &'static str {
        "dns"
    }

    fn order(&self) -> i32 {
        0
    }

    fn claims(&self, config: &DestinationConfig) -> bool {
        config.address.parse::<SocketAddr>().is_err() && split_host_port(&config.address).is_some()
    }

    async fn resolve(
        &self,
        cluster: &Arc<ClusterState>,
        configs: &[DestinationConfig],
    ) -> Result<Vec<ResolvedEndpoint>, ResolveError> {
        let mut resolved: Vec<ResolvedEndpoint> = Vec::new();

        for config in configs {
            let (host, port) = split_host_port(&config.address).ok_or_else(|| ResolveError::InvalidAddress {
                address: config.address.clone(),
            })?;

            let addrs = self
                .lookup
                .lookup(host, port)
                .await
                .map_err(|source| ResolveError::Lookup {
                    host: host.to_string(),
                    source,
                })?;
            if addrs.is_empty() {
                return Err(ResolveError::NoAddresses {
                    host: host.to_string(),
                });
            }

            let host_header = config.host.clone().unwrap_or_else(|| host.to_string());
            for addr in addrs {
                let endpoint = SocketAddr::new(addr.ip(), port);
                if resolved.iter().all(|r| r.endpoint != endpoint) {
                    resolved.push(ResolvedEndpoint {
                        endpoint,
                        host: Some(host_header.clone()),
                    });
                }
            }
        }

        tracing::debug!(
            cluster = %cluster.id(),
            entries = configs.len(),
            endpoints = resolved.len(),
            "DNS resolution complete"
        );
        Ok(resolved)
    }
}
