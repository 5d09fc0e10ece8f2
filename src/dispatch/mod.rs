//! Per-protocol dispatch loops.
//!
//! # Data Flow
//! ```text
//! Listener hands over (connection | datagram | request, RouteState)
//!     → admit()            route limiter, lease held for the whole exchange
//!     → pick_destination() cluster policy over available destinations
//!     → tcp.rs   connect (+bounded retry, re-pick each time) → relay
//!       udp.rs   send once → receive up to N responses
//!       http.rs  HttpForwarder::send → classify outcome
//!     → HealthReporter     report success / destination failure
//!     → drop lease + concurrency guard
//! ```
//!
//! # Design Decisions
//! - Leases and concurrency guards are owned values; every exit path,
//!   including a dropped future, releases them
//! - Only TCP retries, and only the connect phase
//! - Client-side failures never count against a destination

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::cluster::DestinationState;
use crate::health::HealthReporter;
use crate::load_balancer::RequestContext;
use crate::observability::metrics;
use crate::routing::RouteState;
use crate::security::Lease;

pub mod http;
pub mod middleware;
pub mod tcp;
pub mod udp;

pub use http::{ForwardOutcome, HttpDispatcher, HttpForwarder, HyperForwarder, PreselectedDestination};
pub use middleware::{Direction, TcpMiddleware};
pub use tcp::TcpDispatcher;
pub use udp::UdpDispatcher;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no available destination in cluster '{cluster}'")]
    NoAvailableDestination { cluster: String },

    #[error("route '{route}' is rate limited")]
    RateLimited {
        route: String,
        retry_after: Option<Duration>,
    },

    #[error("connecting to cluster '{cluster}' failed after {attempts} attempt(s)")]
    ConnectFailed {
        cluster: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("route '{route}' timed out after {timeout:?}")]
    Timeout { route: String, timeout: Duration },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl DispatchError {
    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::NoAvailableDestination { .. } => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            DispatchError::ConnectFailed { .. } | DispatchError::Io(_) => StatusCode::BAD_GATEWAY,
            DispatchError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (status, self.to_string()).into_response();
        if let DispatchError::RateLimited {
            retry_after: Some(after),
            ..
        } = &self
        {
            // Whole seconds, rounded up so clients never retry early.
            let secs = after.as_secs() + u64::from(after.subsec_nanos() > 0);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs.max(1)));
        }
        response
    }
}

/// Acquire the route's admission lease, if the route is limited.
pub(crate) async fn admit(route: &RouteState, ctx: &RequestContext) -> Result<Option<Lease>, DispatchError> {
    let Some(limiter) = route.limiter() else {
        return Ok(None);
    };
    let lease = limiter.get_limiter(ctx).acquire(1).await;
    if lease.is_acquired() {
        return Ok(Some(lease));
    }

    metrics::record_rate_limited(route.id());
    tracing::debug!(
        route = route.id(),
        client = ?ctx.client_ip(),
        "Admission rejected"
    );
    Err(DispatchError::RateLimited {
        route: route.id().to_string(),
        retry_after: lease.retry_after(),
    })
}

pub(crate) fn report(reporter: &dyn HealthReporter, destination: &Arc<DestinationState>, success: bool) {
    if success {
        reporter.report_success(destination);
    } else {
        reporter.report_failure(destination);
    }
}
