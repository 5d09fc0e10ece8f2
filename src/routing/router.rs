//! Route lookup.
//!
//! # Responsibilities
//! - Hold the per-route runtime state handed to dispatchers
//! - Look up the matching HTTP route for a request
//! - Return matched route or explicit no-match
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks); a config
//!   reload builds a new router
//! - O(n) scan in priority order (acceptable for typical route counts)
//! - Explicit None rather than silent default

use axum::http::request::Parts;
use std::sync::Arc;
use std::time::Duration;

use crate::cluster::ClusterState;
use crate::config::RouteConfig;
use crate::routing::matcher::{AndMatcher, HostMatcher, Matcher, PathPrefixMatcher};
use crate::security::RouteRateLimiter;

/// Everything a dispatcher needs to know about the route it serves.
#[derive(Debug)]
pub struct RouteState {
    id: Arc<str>,
    cluster: Arc<ClusterState>,
    timeout: Duration,
    retry_count: u32,
    udp_response_count: usize,
    limiter: Option<RouteRateLimiter>,
}

impl RouteState {
    /// `default_timeout` applies unless the route overrides it.
    pub fn new(config: &RouteConfig, cluster: Arc<ClusterState>, default_timeout: Duration) -> Self {
        Self {
            id: Arc::from(config.name.as_str()),
            cluster,
            timeout: config
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(default_timeout),
            retry_count: config.retry_count,
            udp_response_count: config.udp_response_count,
            limiter: RouteRateLimiter::create(config.rate_limit.as_ref()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn id_arc(&self) -> Arc<str> {
        self.id.clone()
    }

    pub fn cluster(&self) -> &Arc<ClusterState> {
        &self.cluster
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn udp_response_count(&self) -> usize {
        self.udp_response_count
    }

    pub fn limiter(&self) -> Option<&RouteRateLimiter> {
        self.limiter.as_ref()
    }
}

#[derive(Debug)]
struct CompiledRoute {
    matcher: AndMatcher,
    route: Arc<RouteState>,
}

/// HTTP route table for one listener.
#[derive(Debug, Default)]
pub struct Router {
    routes: Vec<CompiledRoute>,
}

impl Router {
    /// Routes are checked by descending priority; equal priorities keep
    /// configuration order.
    pub fn new(routes: Vec<(&RouteConfig, Arc<RouteState>)>) -> Self {
        let mut compiled: Vec<(u32, CompiledRoute)> = routes
            .into_iter()
            .map(|(config, route)| {
                let mut matchers: Vec<Box<dyn Matcher>> = Vec::new();
                if let Some(host) = &config.host {
                    matchers.push(Box::new(HostMatcher::new(host.as_str())));
                }
                if let Some(prefix) = &config.path_prefix {
                    matchers.push(Box::new(PathPrefixMatcher::new(prefix.as_str())));
                }
                (
                    config.priority,
                    CompiledRoute {
                        matcher: AndMatcher::new(matchers),
                        route,
                    },
                )
            })
            .collect();
        compiled.sort_by(|a, b| b.0.cmp(&a.0));

        Self {
            routes: compiled.into_iter().map(|(_, route)| route).collect(),
        }
    }

    pub fn route(&self, req: &Parts) -> Option<Arc<RouteState>> {
        self.routes
            .iter()
            .find(|r| r.matcher.matches(req))
            .map(|r| r.route.clone())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
