//! Route admission control.
//!
//! A route carries at most one [`RouteRateLimiter`]. It resolves, per
//! request, the concrete limiter to acquire against: a single shared one
//! (`Count`, `Total`) or one per partition key (`Ip`, `Key`), created on first
//! sight of the key.
//!
//! Partition keys are client controlled, so idle partitions are swept every
//! [`SWEEP_INTERVAL`] new keys. A partition is idle when no caller holds it
//! and its limiter has its full budget back; rebuilding it later is
//! indistinguishable from keeping it.

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::{LimiterAlgorithm, RateLimitConfig, RateLimitPolicy};
use crate::load_balancer::RequestContext;
use crate::security::limiters::{build_algorithm, build_limiter, ConcurrencyLimiter, RateLimiter};

#[derive(Debug, Clone, PartialEq, Eq)]
enum PartitionKey {
    ClientIp,
    Header(String),
    Cookie(String),
}

#[derive(Debug)]
enum Scope {
    Shared(Arc<dyn RateLimiter>),
    Partitioned {
        key: PartitionKey,
        algorithm: LimiterAlgorithm,
        partitions: DashMap<String, Arc<dyn RateLimiter>>,
        created: AtomicUsize,
    },
}

/// New partitions between two idle sweeps.
pub const SWEEP_INTERVAL: usize = 256;

#[derive(Debug)]
pub struct RouteRateLimiter {
    config: RateLimitConfig,
    scope: Scope,
}

impl RouteRateLimiter {
    /// Build the limiter for a route; `None` means no admission control.
    pub fn create(config: Option<&RateLimitConfig>) -> Option<Self> {
        let config = config?.clone();
        let scope = match config.policy {
            RateLimitPolicy::Count => Scope::Shared(Arc::new(ConcurrencyLimiter::new(
                config.permit_limit,
                config.queue_limit,
            ))),
            RateLimitPolicy::Total => Scope::Shared(build_limiter(&config)),
            RateLimitPolicy::Ip => Scope::Partitioned {
                key: PartitionKey::ClientIp,
                algorithm: LimiterAlgorithm::Concurrency,
                partitions: DashMap::new(),
                created: AtomicUsize::new(0),
            },
            RateLimitPolicy::Key => {
                let key = match (&config.header, &config.cookie) {
                    (Some(header), _) => PartitionKey::Header(header.clone()),
                    (None, Some(cookie)) => PartitionKey::Cookie(cookie.clone()),
                    (None, None) => return None,
                };
                Scope::Partitioned {
                    key,
                    algorithm: config.algorithm,
                    partitions: DashMap::new(),
                    created: AtomicUsize::new(0),
                }
            }
        };
        Some(Self { config, scope })
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.config.policy
    }

    /// The limiter this request must acquire against.
    ///
    /// Requests without a partition key share the empty-key partition.
    pub fn get_limiter(&self, ctx: &RequestContext) -> Arc<dyn RateLimiter> {
        match &self.scope {
            Scope::Shared(limiter) => limiter.clone(),
            Scope::Partitioned {
                key,
                algorithm,
                partitions,
                created,
            } => {
                let value = match key {
                    PartitionKey::ClientIp => ctx.client_ip().map(|ip| ip.to_string()),
                    PartitionKey::Header(name) => ctx.header(name).map(str::to_string),
                    PartitionKey::Cookie(name) => ctx.cookie(name).map(str::to_string),
                }
                .unwrap_or_default();

                if let Some(limiter) = partitions.get(&value) {
                    return limiter.clone();
                }
                let limiter = partitions
                    .entry(value)
                    .or_insert_with(|| build_algorithm(*algorithm, &self.config))
                    .clone();

                // The entry guard is gone; sweeping cannot deadlock on it.
                if created.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
                    self.sweep_idle();
                }
                limiter
            }
        }
    }

    /// Drop partitions nobody holds whose limiter is idle.
    ///
    /// Returns how many were removed.
    pub fn sweep_idle(&self) -> usize {
        let Scope::Partitioned { partitions, .. } = &self.scope else {
            return 0;
        };
        let before = partitions.len();
        partitions.retain(|_, limiter| Arc::strong_count(limiter) > 1 || !limiter.is_idle());
        let removed = before.saturating_sub(partitions.len());
        if removed > 0 {
            tracing::debug!(removed, remaining = partitions.len(), "Idle rate limit partitions evicted");
        }
        removed
    }

    pub fn partition_count(&self) -> usize {
        match &self.scope {
            Scope::Shared(_) => 1,
            Scope::Partitioned { partitions, .. } => partitions.len(),
        }
    }
}
