//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_requests_total` (counter): dispatched requests by protocol, cluster, status
//! - `proxy_request_duration_seconds` (histogram): dispatch latency
//! - `proxy_destination_health` (gauge): 1=healthy, 0.5=unknown, 0=unhealthy
//! - `proxy_rate_limited_total` (counter): admission rejections by route
//! - `proxy_connect_attempts_total` (counter): TCP connect attempts by outcome

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Instant;

use crate::cluster::HealthState;

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(protocol: &'static str, cluster: &str, status: u16, start: Instant) {
    let labels = [
        ("protocol", protocol.to_string()),
        ("cluster", cluster.to_string()),
        ("status", status.to_string()),
    ];
    counter!("proxy_requests_total", &labels[..]).increment(1);
    histogram!("proxy_request_duration_seconds", &labels[..2]).record(start.elapsed().as_secs_f64());
}

pub fn record_destination_health(cluster: &str, endpoint: SocketAddr, state: HealthState) {
    let value = match state {
        HealthState::Healthy => 1.0,
        HealthState::Unknown => 0.5,
        HealthState::Unhealthy => 0.0,
    };
    gauge!(
        "proxy_destination_health",
        "cluster" => cluster.to_string(),
        "destination" => endpoint.to_string()
    )
    .set(value);
}

pub fn record_rate_limited(route: &str) {
    counter!("proxy_rate_limited_total", "route" => route.to_string()).increment(1);
}

pub fn record_connect_attempt(cluster: &str, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    counter!(
        "proxy_connect_attempts_total",
        "cluster" => cluster.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}
