//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (routes reference existing listeners and clusters)
//! - Resolve policy and probe names against their registries
//! - Validate value ranges (intervals > 0, thresholds > 0, rates in 0..=1)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;
use thiserror::Error;

use crate::config::schema::{
    ClusterConfig, LimiterAlgorithm, ProxyConfig, RateLimitConfig, RateLimitPolicy, RouteConfig,
};
use crate::health::probe;
use crate::load_balancer::{affinity, registry};

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("duplicate {kind} name '{name}'")]
    DuplicateName { kind: &'static str, name: String },

    #[error("invalid bind address '{address}' for listener '{listener}'")]
    InvalidBindAddress { listener: String, address: String },

    #[error("route '{route}' references unknown listener '{listener}'")]
    UnknownListener { route: String, listener: String },

    #[error("route '{route}' references unknown cluster '{cluster}'")]
    UnknownCluster { route: String, cluster: String },

    #[error("cluster '{cluster}' uses unknown load balancing policy '{policy}'")]
    UnknownLoadBalancingPolicy { cluster: String, policy: String },

    #[error("cluster '{cluster}' uses unknown health probe '{policy}'")]
    UnknownProbePolicy { cluster: String, policy: String },

    #[error("cluster '{cluster}' has invalid health check: {reason}")]
    InvalidHealthCheck { cluster: String, reason: String },

    #[error("cluster '{cluster}' has invalid destination '{address}'")]
    InvalidDestination { cluster: String, address: String },

    #[error("cluster '{cluster}': {reason}")]
    InvalidPolicyOptions { cluster: String, reason: String },

    #[error("route '{route}' has invalid rate limit: {reason}")]
    InvalidRateLimit { route: String, reason: String },
}

/// Validate a configuration, collecting every problem.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let mut listeners = HashSet::new();
    for listener in &config.listeners {
        if !listeners.insert(listener.name.as_str()) {
            errors.push(ValidationError::DuplicateName {
                kind: "listener",
                name: listener.name.clone(),
            });
        }
        if listener.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::InvalidBindAddress {
                listener: listener.name.clone(),
                address: listener.bind_address.clone(),
            });
        }
    }

    let mut clusters = HashSet::new();
    for cluster in &config.clusters {
        if !clusters.insert(cluster.name.as_str()) {
            errors.push(ValidationError::DuplicateName {
                kind: "cluster",
                name: cluster.name.clone(),
            });
        }
        validate_cluster(cluster, &mut errors);
    }

    let mut routes = HashSet::new();
    for route in &config.routes {
        if !routes.insert(route.name.as_str()) {
            errors.push(ValidationError::DuplicateName {
                kind: "route",
                name: route.name.clone(),
            });
        }
        if !listeners.contains(route.listener.as_str()) {
            errors.push(ValidationError::UnknownListener {
                route: route.name.clone(),
                listener: route.listener.clone(),
            });
        }
        if !clusters.contains(route.cluster.as_str()) {
            errors.push(ValidationError::UnknownCluster {
                route: route.name.clone(),
                cluster: route.cluster.clone(),
            });
        }
        if let Some(limit) = &route.rate_limit {
            validate_rate_limit(route, limit, &mut errors);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_cluster(cluster: &ClusterConfig, errors: &mut Vec<ValidationError>) {
    let name = &cluster.name;

    if !registry::is_known_policy(&cluster.load_balancing_policy) {
        errors.push(ValidationError::UnknownLoadBalancingPolicy {
            cluster: name.clone(),
            policy: cluster.load_balancing_policy.clone(),
        });
    }

    if cluster.load_balancing_policy.eq_ignore_ascii_case(registry::HASH) {
        let has_key = cluster
            .hash
            .as_ref()
            .map(|h| h.header.is_some() || h.cookie.is_some() || h.item.is_some())
            .unwrap_or(false);
        if !has_key {
            errors.push(ValidationError::InvalidPolicyOptions {
                cluster: name.clone(),
                reason: "Hash policy requires a header, cookie or item key".to_string(),
            });
        }
    }

    if let Some(affinity) = &cluster.session_affinity {
        if let Err(e) = affinity::TokenProtector::from_config(affinity) {
            errors.push(ValidationError::InvalidPolicyOptions {
                cluster: name.clone(),
                reason: e.to_string(),
            });
        }
    }

    for destination in &cluster.destinations {
        // Unresolved entries must at least carry a port.
        let valid = destination.address.parse::<SocketAddr>().is_ok()
            || destination
                .address
                .rsplit_once(':')
                .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
                .unwrap_or(false);
        if !valid {
            errors.push(ValidationError::InvalidDestination {
                cluster: name.clone(),
                address: destination.address.clone(),
            });
        }
    }

    if let Some(active) = &cluster.health_check.active {
        if !probe::is_known_probe(&active.policy) {
            errors.push(ValidationError::UnknownProbePolicy {
                cluster: name.clone(),
                policy: active.policy.clone(),
            });
        }
        let mut invalid = |reason: &str| {
            errors.push(ValidationError::InvalidHealthCheck {
                cluster: name.clone(),
                reason: reason.to_string(),
            })
        };
        if active.interval_ms == 0 {
            invalid("active interval must be greater than zero");
        }
        if active.timeout_ms == 0 {
            invalid("active timeout must be greater than zero");
        }
        if active.fails == 0 || active.passes == 0 {
            invalid("active fails and passes thresholds must be at least 1");
        }
        if !active.path.starts_with('/') {
            invalid("active path must start with '/'");
        }
        if !matches!(active.method.to_ascii_uppercase().as_str(), "GET" | "HEAD") {
            invalid("active method must be GET or HEAD");
        }
    }

    if let Some(passive) = &cluster.health_check.passive {
        let mut invalid = |reason: &str| {
            errors.push(ValidationError::InvalidHealthCheck {
                cluster: name.clone(),
                reason: reason.to_string(),
            })
        };
        if passive.detection_window_ms == 0 {
            invalid("passive detection window must be greater than zero");
        }
        if !(0.0..=1.0).contains(&passive.failure_rate_limit) {
            invalid("passive failure rate limit must be within 0.0..=1.0");
        }
    }
}

fn validate_rate_limit(route: &RouteConfig, limit: &RateLimitConfig, errors: &mut Vec<ValidationError>) {
    let mut invalid = |reason: &str| {
        errors.push(ValidationError::InvalidRateLimit {
            route: route.name.clone(),
            reason: reason.to_string(),
        })
    };

    if limit.permit_limit == 0 {
        invalid("permit_limit must be greater than zero");
    }
    if limit.policy == RateLimitPolicy::Key && limit.header.is_none() && limit.cookie.is_none() {
        invalid("key policy requires a header or cookie");
    }
    if matches!(limit.policy, RateLimitPolicy::Key | RateLimitPolicy::Total) {
        match limit.algorithm {
            LimiterAlgorithm::FixedWindow | LimiterAlgorithm::SlidingWindow if limit.window_ms == 0 => {
                invalid("window_ms must be greater than zero");
            }
            LimiterAlgorithm::SlidingWindow if limit.segments_per_window == 0 => {
                invalid("segments_per_window must be greater than zero");
            }
            LimiterAlgorithm::TokenBucket
                if limit.replenishment_period_ms == 0 || limit.tokens_per_period == 0 =>
            {
                invalid("token bucket needs a replenishment period and tokens per period");
            }
            _ => {}
        }
    }
}
