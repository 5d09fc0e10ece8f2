//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener endpoints (HTTP, TCP, UDP).
    pub listeners: Vec<ListenerConfig>,

    /// Route definitions mapping traffic to clusters.
    pub routes: Vec<RouteConfig>,

    /// Cluster definitions (destinations, policies, health checks).
    pub clusters: Vec<ClusterConfig>,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Transport protocol served by a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Tcp,
    Udp,
}

/// Listener configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ListenerConfig {
    /// Listener identifier, referenced by routes.
    pub name: String,

    /// Protocol accepted on this endpoint.
    pub protocol: Protocol,

    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure, TCP only).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_max_connections() -> usize {
    10_000
}

/// Route configuration mapping a listener's traffic to a cluster.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Route identifier for logging/metrics and per-route policy state.
    pub name: String,

    /// Listener this route is attached to.
    pub listener: String,

    /// Host header to match (exact, case-insensitive). HTTP only.
    #[serde(default)]
    pub host: Option<String>,

    /// Path prefix to match. HTTP only.
    #[serde(default)]
    pub path_prefix: Option<String>,

    /// Cluster to forward to.
    pub cluster: String,

    /// Route priority (higher = checked first).
    #[serde(default)]
    pub priority: u32,

    /// Route timeout override in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Additional TCP connect attempts after the first one fails.
    #[serde(default)]
    pub retry_count: u32,

    /// Maximum number of UDP responses relayed per datagram.
    #[serde(default = "default_udp_response_count")]
    pub udp_response_count: usize,

    /// Admission control for this route.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

fn default_udp_response_count() -> usize {
    1
}

/// Cluster configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ClusterConfig {
    /// Unique cluster identifier.
    pub name: String,

    /// Load balancing policy name (Random, RoundRobin, LeastRequests,
    /// PowerOfTwoChoices, Hash).
    #[serde(default = "default_policy")]
    pub load_balancing_policy: String,

    /// Key source for the Hash policy.
    #[serde(default)]
    pub hash: Option<HashPolicyConfig>,

    /// Session affinity wrapped around the base policy.
    #[serde(default)]
    pub session_affinity: Option<SessionAffinityConfig>,

    /// Active and passive health checks.
    #[serde(default)]
    pub health_check: HealthCheckConfig,

    /// How health filters destinations.
    #[serde(default)]
    pub available_destinations: AvailableDestinationsMode,

    /// Re-resolution period for destinations that need DNS, in seconds.
    #[serde(default)]
    pub dns_refresh_secs: Option<u64>,

    /// Backend destinations.
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
}

fn default_policy() -> String {
    "RoundRobin".to_string()
}

impl ClusterConfig {
    /// A cluster with the given name, destinations and default settings.
    pub fn new(name: impl Into<String>, destinations: Vec<DestinationConfig>) -> Self {
        Self {
            name: name.into(),
            load_balancing_policy: default_policy(),
            hash: None,
            session_affinity: None,
            health_check: HealthCheckConfig::default(),
            available_destinations: AvailableDestinationsMode::default(),
            dns_refresh_secs: None,
            destinations,
        }
    }

    pub fn dns_refresh(&self) -> Option<Duration> {
        self.dns_refresh_secs.filter(|s| *s > 0).map(Duration::from_secs)
    }
}

/// Backend destination configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct DestinationConfig {
    /// Address as "ip:port" (used as-is) or "host:port" (resolved).
    pub address: String,

    /// Host header to send upstream. Defaults to the configured hostname.
    #[serde(default)]
    pub host: Option<String>,
}

impl DestinationConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            host: None,
        }
    }
}

/// Availability filter applied after health changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AvailableDestinationsMode {
    /// Healthy and Unknown destinations receive traffic.
    #[default]
    HealthyAndUnknown,
    /// Like `HealthyAndUnknown`, but falls back to all destinations when none pass.
    HealthyOrPanic,
}

/// Where the Hash policy reads its key from.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct HashPolicyConfig {
    pub header: Option<String>,
    pub cookie: Option<String>,
    pub item: Option<String>,
}

/// How an affinity token travels between client and proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AffinityTransport {
    #[default]
    Cookie,
    Header,
}

/// How a destination identity is encoded into an affinity token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AffinityEncoding {
    /// Plaintext "ip:port".
    Address,
    /// Hex SHA-256 digest of the address.
    #[default]
    Sha256,
    /// Hex 64-bit hash of the address.
    Hash64,
}

/// Session affinity configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SessionAffinityConfig {
    /// Cookie or header name carrying the token.
    #[serde(default = "default_affinity_name")]
    pub name: String,

    #[serde(default)]
    pub transport: AffinityTransport,

    #[serde(default)]
    pub encoding: AffinityEncoding,

    /// Protect tokens with AES-256-GCM.
    #[serde(default)]
    pub encrypt: bool,

    /// Base64 encoded 32 byte key. A random key is generated when absent.
    #[serde(default)]
    pub key: Option<String>,

    /// Cookie path attribute.
    #[serde(default)]
    pub cookie_path: Option<String>,
}

fn default_affinity_name() -> String {
    ".Proxy.Affinity".to_string()
}

/// Health check configuration for a cluster.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub active: Option<ActiveHealthCheckConfig>,
    pub passive: Option<PassiveHealthCheckConfig>,
}

/// Active (out-of-band) health check configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ActiveHealthCheckConfig {
    /// Probe policy name ("Connect" or "Http").
    pub policy: String,

    /// Probe interval in milliseconds.
    pub interval_ms: u64,

    /// Per-probe timeout in milliseconds.
    pub timeout_ms: u64,

    /// Consecutive passes before marking healthy.
    pub passes: u32,

    /// Consecutive failures before marking unhealthy.
    pub fails: u32,

    /// Path probed by the Http policy.
    pub path: String,

    /// Method used by the Http policy (GET or HEAD).
    pub method: String,
}

impl Default for ActiveHealthCheckConfig {
    fn default() -> Self {
        Self {
            policy: "Connect".to_string(),
            interval_ms: 10_000,
            timeout_ms: 5_000,
            passes: 1,
            fails: 1,
            path: "/".to_string(),
            method: "GET".to_string(),
        }
    }
}

impl ActiveHealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Passive (traffic observed) health check configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PassiveHealthCheckConfig {
    /// Sliding detection window in milliseconds.
    pub detection_window_ms: u64,

    /// Samples required inside the window before the rate is trusted.
    pub minimal_total_count_threshold: u64,

    /// Failure rate (0.0..=1.0) at which a destination is marked unhealthy.
    pub failure_rate_limit: f64,

    /// Cool-down before an unhealthy destination is offered again, in milliseconds.
    pub reactivation_period_ms: u64,
}

impl Default for PassiveHealthCheckConfig {
    fn default() -> Self {
        Self {
            detection_window_ms: 60_000,
            minimal_total_count_threshold: 10,
            failure_rate_limit: 0.3,
            reactivation_period_ms: 60_000,
        }
    }
}

impl PassiveHealthCheckConfig {
    pub fn detection_window(&self) -> Duration {
        Duration::from_millis(self.detection_window_ms)
    }

    pub fn reactivation_period(&self) -> Duration {
        Duration::from_millis(self.reactivation_period_ms)
    }
}

/// Scope of a route's rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitPolicy {
    /// Maximum concurrent requests for the whole route.
    #[default]
    Count,
    /// Maximum concurrent requests per client IP.
    Ip,
    /// One limiter per header or cookie value.
    Key,
    /// One shared limiter using the configured algorithm.
    Total,
}

/// Admission algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterAlgorithm {
    #[default]
    Concurrency,
    TokenBucket,
    FixedWindow,
    SlidingWindow,
}

/// Rate limiting configuration for a route.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub policy: RateLimitPolicy,

    /// Algorithm used by `Key` and `Total` limiters.
    pub algorithm: LimiterAlgorithm,

    /// Header supplying the partition key (`Key` policy).
    pub header: Option<String>,

    /// Cookie supplying the partition key (`Key` policy).
    pub cookie: Option<String>,

    /// Permits available per window / bucket / concurrency slot set.
    pub permit_limit: usize,

    /// Permits that may wait for availability; 0 rejects immediately.
    pub queue_limit: usize,

    /// Window length for fixed and sliding windows, in milliseconds.
    pub window_ms: u64,

    /// Segments per sliding window.
    pub segments_per_window: usize,

    /// Tokens added per replenishment period.
    pub tokens_per_period: usize,

    /// Token bucket replenishment period in milliseconds.
    pub replenishment_period_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            policy: RateLimitPolicy::Count,
            algorithm: LimiterAlgorithm::Concurrency,
            header: None,
            cookie: None,
            permit_limit: 100,
            queue_limit: 0,
            window_ms: 1_000,
            segments_per_window: 4,
            tokens_per_period: 10,
            replenishment_period_ms: 1_000,
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Transport connect timeout per attempt, in milliseconds.
    pub connect_ms: u64,

    /// Default route timeout in milliseconds.
    pub route_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 5_000,
            route_ms: 30_000,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
