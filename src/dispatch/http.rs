//! HTTP dispatch: pick once, forward, classify, report.
//!
//! # Outcome Classification
//! ```text
//! ForwardOutcome            reported as
//! ─────────────────────────────────────────
//! Success                   success
//! RequestFailed             failure   (connect/send/receive to destination)
//! Timeout                   failure   (no response head within route timeout)
//! ResponseBodyDestination   failure   (destination broke the body stream)
//! RequestBodyClient         nothing   (client broke its own body)
//! BadRequest                nothing   (request could not be addressed)
//! ```
//!
//! # Design Decisions
//! - Each attempt is reported once. A successful head defers the report to
//!   the body: success at end of stream, failure on the first stream error,
//!   nothing if the client goes away first
//! - The concurrency guard and admission lease ride along with the response
//!   body, so least-requests sees a request as outstanding until the body
//!   has been streamed or dropped
//! - Affinity headers are only attached to responses that came from the
//!   chosen destination

use async_trait::async_trait;
use axum::body::{Body, BodyDataStream, HttpBody};
use axum::http::uri::{Authority, PathAndQuery, Scheme};
use axum::http::{header, HeaderValue, Request, Response, StatusCode, Uri, Version};
use futures_util::StreamExt;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::cluster::{ConcurrencyGuard, DestinationState};
use crate::dispatch::{admit, report, DispatchError};
use crate::health::HealthReporter;
use crate::load_balancer::{pick_destination, RequestContext};
use crate::observability::metrics;
use crate::routing::RouteState;
use crate::security::headers::{add_forwarded, strip_hop_by_hop};
use crate::security::Lease;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    Success,
    RequestFailed,
    Timeout,
    ResponseBodyDestination,
    RequestBodyClient,
    BadRequest,
}

impl ForwardOutcome {
    pub fn is_destination_failure(self) -> bool {
        matches!(
            self,
            ForwardOutcome::RequestFailed | ForwardOutcome::Timeout | ForwardOutcome::ResponseBodyDestination
        )
    }
}

/// Request extension naming a destination chosen before dispatch.
#[derive(Debug, Clone)]
pub struct PreselectedDestination(pub Arc<DestinationState>);

#[async_trait]
pub trait HttpForwarder: Send + Sync {
    /// Send `request` to `destination`; the response is always usable, even
    /// for failed outcomes.
    async fn send(
        &self,
        request: Request<Body>,
        destination: &DestinationState,
        timeout: Duration,
    ) -> (ForwardOutcome, Response<Body>);
}

fn status_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::from(status.canonical_reason().unwrap_or_default()));
    *response.status_mut() = status;
    response
}

fn caused_by_client_body(error: &(dyn StdError + 'static)) -> bool {
    let mut source = Some(error);
    while let Some(e) = source {
        if e.is::<axum::Error>() {
            return true;
        }
        // hyper marks failures of the body it was handed as user errors.
        if e.downcast_ref::<hyper::Error>().is_some_and(hyper::Error::is_user) {
            return true;
        }
        source = e.source();
    }
    false
}

/// Forwarder over the hyper-util pooled client.
pub struct HyperForwarder {
    client: Client<HttpConnector, Body>,
}

impl HyperForwarder {
    pub fn new() -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self { client }
    }
}

impl Default for HyperForwarder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpForwarder for HyperForwarder {
    async fn send(
        &self,
        request: Request<Body>,
        destination: &DestinationState,
        timeout: Duration,
    ) -> (ForwardOutcome, Response<Body>) {
        let (mut parts, body) = request.into_parts();

        // URI rewrite
        let mut uri_parts = parts.uri.clone().into_parts();
        uri_parts.scheme = Some(Scheme::HTTP);
        uri_parts.authority = destination.endpoint().to_string().parse::<Authority>().ok();
        if uri_parts.path_and_query.is_none() {
            uri_parts.path_and_query = Some(PathAndQuery::from_static("/"));
        }
        parts.uri = match Uri::from_parts(uri_parts) {
            Ok(uri) => uri,
            Err(e) => {
                debug!(error = %e, "Cannot address request to destination");
                return (ForwardOutcome::BadRequest, status_response(StatusCode::BAD_REQUEST));
            }
        };
        parts.version = Version::HTTP_11;
        if let Some(host) = destination.host() {
            if let Ok(value) = HeaderValue::from_str(host) {
                parts.headers.insert(header::HOST, value);
            }
        }

        let request = Request::from_parts(parts, body);
        match tokio::time::timeout(timeout, self.client.request(request)).await {
            Err(_) => (ForwardOutcome::Timeout, status_response(StatusCode::GATEWAY_TIMEOUT)),
            Ok(Err(e)) if caused_by_client_body(&e) => {
                debug!(error = %e, "Client request body failed");
                (ForwardOutcome::RequestBodyClient, status_response(StatusCode::BAD_REQUEST))
            }
            Ok(Err(e)) => {
                debug!(destination = %destination.endpoint(), error = %e, "Upstream request failed");
                (ForwardOutcome::RequestFailed, status_response(StatusCode::BAD_GATEWAY))
            }
            Ok(Ok(response)) => {
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                (ForwardOutcome::Success, Response::from_parts(parts, Body::new(body)))
            }
        }
    }
}

fn report_outcome(reporter: &dyn HealthReporter, destination: &Arc<DestinationState>, outcome: ForwardOutcome) {
    if outcome == ForwardOutcome::Success {
        report(reporter, destination, true);
    } else if outcome.is_destination_failure() {
        report(reporter, destination, false);
    }
}

pub struct HttpDispatcher {
    forwarder: Arc<dyn HttpForwarder>,
    reporter: Arc<dyn HealthReporter>,
}

impl HttpDispatcher {
    pub fn new(forwarder: Arc<dyn HttpForwarder>, reporter: Arc<dyn HealthReporter>) -> Self {
        Self { forwarder, reporter }
    }

    pub async fn dispatch(
        &self,
        request: Request<Body>,
        peer: SocketAddr,
        route: &RouteState,
    ) -> Result<Response<Body>, DispatchError> {
        let start = Instant::now();
        let result = self.exchange(request, peer, route).await;
        let status = match &result {
            Ok(response) => response.status().as_u16(),
            Err(e) => e.status().as_u16(),
        };
        metrics::record_request("http", route.cluster().id(), status, start);
        result
    }

    async fn exchange(
        &self,
        mut request: Request<Body>,
        peer: SocketAddr,
        route: &RouteState,
    ) -> Result<Response<Body>, DispatchError> {
        let cluster = route.cluster();
        let preselected = request.extensions_mut().remove::<PreselectedDestination>();
        let mut ctx = RequestContext::new(route.id_arc())
            .with_remote_addr(peer)
            .with_headers(request.headers().clone());

        let lease = admit(route, &ctx).await?;

        let destination = match preselected {
            Some(PreselectedDestination(destination)) => destination,
            None => pick_destination(&mut ctx, cluster).ok_or_else(|| DispatchError::NoAvailableDestination {
                cluster: cluster.id().to_string(),
            })?,
        };
        let guard = destination.track();

        let headers = request.headers_mut();
        strip_hop_by_hop(headers);
        add_forwarded(headers, Some(peer.ip()), "http");

        let (outcome, response) = self.forwarder.send(request, &destination, route.timeout()).await;

        if outcome != ForwardOutcome::Success {
            report_outcome(self.reporter.as_ref(), &destination, outcome);
            if outcome.is_destination_failure() {
                warn!(
                    route = route.id(),
                    cluster = cluster.id(),
                    destination = %destination.endpoint(),
                    outcome = ?outcome,
                    "Forwarding failed"
                );
            }
            return Ok(response);
        }

        debug!(
            route = route.id(),
            destination = %destination.endpoint(),
            status = %response.status(),
            "Forwarded request"
        );

        let (mut parts, body) = response.into_parts();
        for (name, value) in ctx.response_headers() {
            parts.headers.append(name.clone(), value.clone());
        }
        let body = self.track_body(body, destination, (guard, lease));
        Ok(Response::from_parts(parts, body))
    }

    /// Keep `held` alive for the body's lifetime and report the attempt's
    /// outcome when the body ends.
    fn track_body(
        &self,
        body: Body,
        destination: Arc<DestinationState>,
        held: (ConcurrencyGuard, Option<Lease>),
    ) -> Body {
        if body.is_end_stream() {
            report_outcome(self.reporter.as_ref(), &destination, ForwardOutcome::Success);
            return body;
        }

        let watch = BodyWatch {
            inner: body.into_data_stream(),
            reporter: self.reporter.clone(),
            destination,
            _held: held,
        };
        Body::from_stream(futures_util::stream::unfold(Some(watch), |watch| async move {
            let mut watch = watch?;
            match watch.inner.next().await {
                Some(Ok(chunk)) => Some((Ok(chunk), Some(watch))),
                Some(Err(e)) => {
                    warn!(destination = %watch.destination.endpoint(), error = %e, "Destination response body failed");
                    watch.report(ForwardOutcome::ResponseBodyDestination);
                    // Yield the error, then end without touching the body again.
                    Some((Err(e), None))
                }
                None => {
                    watch.report(ForwardOutcome::Success);
                    None
                }
            }
        }))
    }
}

/// Response body in flight plus what it keeps alive.
struct BodyWatch {
    inner: BodyDataStream,
    reporter: Arc<dyn HealthReporter>,
    destination: Arc<DestinationState>,
    _held: (ConcurrencyGuard, Option<Lease>),
}

impl BodyWatch {
    fn report(&self, outcome: ForwardOutcome) {
        report_outcome(self.reporter.as_ref(), &self.destination, outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterState, HealthState};
    use crate::config::{
        ClusterConfig, DestinationConfig, PassiveHealthCheckConfig, RateLimitConfig, RouteConfig,
        SessionAffinityConfig,
    };
    use crate::health::PassiveHealthReporter;
    use crate::lifecycle::Shutdown;
    use crate::resolver::DestinationResolverManager;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Counts {
        failures: AtomicUsize,
        successes: AtomicUsize,
    }

    impl HealthReporter for Counts {
        fn report_failure(&self, _destination: &Arc<DestinationState>) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }

        fn report_success(&self, _destination: &Arc<DestinationState>) {
            self.successes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FixedForwarder {
        outcome: ForwardOutcome,
        seen: Mutex<Vec<SocketAddr>>,
    }

    impl FixedForwarder {
        fn new(outcome: ForwardOutcome) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl HttpForwarder for FixedForwarder {
        async fn send(
            &self,
            request: Request<Body>,
            destination: &DestinationState,
            _timeout: Duration,
        ) -> (ForwardOutcome, Response<Body>) {
            assert!(request.headers().contains_key("x-forwarded-for"));
            self.seen.lock().unwrap().push(destination.endpoint());
            let status = match self.outcome {
                ForwardOutcome::Success => StatusCode::OK,
                ForwardOutcome::Timeout => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::BAD_GATEWAY,
            };
            (self.outcome, status_response(status))
        }
    }

    /// Answers 200, then breaks the body after the first chunk.
    struct BrokenBodyForwarder;

    #[async_trait]
    impl HttpForwarder for BrokenBodyForwarder {
        async fn send(
            &self,
            _request: Request<Body>,
            _destination: &DestinationState,
            _timeout: Duration,
        ) -> (ForwardOutcome, Response<Body>) {
            let chunks: Vec<Result<&'static str, std::io::Error>> =
                vec![Ok("partial"), Err(std::io::Error::other("connection reset"))];
            let body = Body::from_stream(futures_util::stream::iter(chunks));
            (ForwardOutcome::Success, Response::new(body))
        }
    }

    async fn route(cluster_config: ClusterConfig, rate_limit: Option<RateLimitConfig>) -> RouteState {
        let cluster = ClusterState::from_config(cluster_config).unwrap();
        Arc::new(DestinationResolverManager::with_dns(Shutdown::new()))
            .initialize(&cluster)
            .await
            .unwrap();
        let config = RouteConfig {
            name: "web".into(),
            listener: "http".into(),
            host: None,
            path_prefix: None,
            cluster: cluster.id().to_string(),
            priority: 0,
            timeout_ms: None,
            retry_count: 0,
            udp_response_count: 1,
            rate_limit,
        };
        RouteState::new(&config, cluster, Duration::from_secs(5))
    }

    fn two_destinations() -> ClusterConfig {
        ClusterConfig::new(
            "web",
            vec![DestinationConfig::new("127.0.0.1:7101"), DestinationConfig::new("127.0.0.1:7102")],
        )
    }

    fn request() -> Request<Body> {
        Request::builder().uri("/index").body(Body::empty()).unwrap()
    }

    fn peer() -> SocketAddr {
        "198.51.100.4:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn destination_failures_are_reported() {
        let route = route(two_destinations(), None).await;
        let reporter = Arc::new(Counts::default());
        let dispatcher = HttpDispatcher::new(FixedForwarder::new(ForwardOutcome::Timeout), reporter.clone());

        let response = dispatcher.dispatch(request(), peer(), &route).await.unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(reporter.failures.load(Ordering::SeqCst), 1);
        assert_eq!(reporter.successes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn client_failures_are_not_reported() {
        let route = route(two_destinations(), None).await;
        let reporter = Arc::new(Counts::default());
        let dispatcher =
            HttpDispatcher::new(FixedForwarder::new(ForwardOutcome::RequestBodyClient), reporter.clone());

        dispatcher.dispatch(request(), peer(), &route).await.unwrap();
        assert_eq!(reporter.failures.load(Ordering::SeqCst), 0);
        assert_eq!(reporter.successes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn success_reported_once_body_completes() {
        let route = route(two_destinations(), None).await;
        let reporter = Arc::new(Counts::default());
        let dispatcher = HttpDispatcher::new(FixedForwarder::new(ForwardOutcome::Success), reporter.clone());

        let response = dispatcher.dispatch(request(), peer(), &route).await.unwrap();
        assert_eq!(reporter.successes.load(Ordering::SeqCst), 0);

        axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(reporter.successes.load(Ordering::SeqCst), 1);
        assert_eq!(reporter.failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dropped_body_reports_nothing() {
        let route = route(two_destinations(), None).await;
        let reporter = Arc::new(Counts::default());
        let dispatcher = HttpDispatcher::new(FixedForwarder::new(ForwardOutcome::Success), reporter.clone());

        let response = dispatcher.dispatch(request(), peer(), &route).await.unwrap();
        drop(response);
        assert_eq!(reporter.successes.load(Ordering::SeqCst), 0);
        assert_eq!(reporter.failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn broken_body_counts_as_one_failure() {
        let route = route(two_destinations(), None).await;
        let reporter = Arc::new(Counts::default());
        let dispatcher = HttpDispatcher::new(Arc::new(BrokenBodyForwarder), reporter.clone());

        for round in 1..=3 {
            let response = dispatcher.dispatch(request(), peer(), &route).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(axum::body::to_bytes(response.into_body(), 1024).await.is_err());
            assert_eq!(reporter.failures.load(Ordering::SeqCst), round);
            assert_eq!(reporter.successes.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn broken_bodies_deactivate_destination() {
        let mut cluster = ClusterConfig::new("web", vec![DestinationConfig::new("127.0.0.1:7101")]);
        cluster.health_check.passive = Some(PassiveHealthCheckConfig {
            minimal_total_count_threshold: 4,
            failure_rate_limit: 0.6,
            ..PassiveHealthCheckConfig::default()
        });
        let route = route(cluster, None).await;
        let destination = route.cluster().destinations().get(0).cloned().unwrap();
        let dispatcher = HttpDispatcher::new(Arc::new(BrokenBodyForwarder), Arc::new(PassiveHealthReporter::new()));

        for _ in 0..20 {
            let Ok(response) = dispatcher.dispatch(request(), peer(), &route).await else {
                // Deactivated: nothing left to pick.
                break;
            };
            let _ = axum::body::to_bytes(response.into_body(), 1024).await;
        }
        assert_eq!(destination.health(), HealthState::Unhealthy);
    }

    #[tokio::test]
    async fn guard_lives_until_body_dropped() {
        let route = route(two_destinations(), None).await;
        let forwarder = FixedForwarder::new(ForwardOutcome::Success);
        let dispatcher = HttpDispatcher::new(forwarder.clone(), Arc::new(Counts::default()));

        let response = dispatcher.dispatch(request(), peer(), &route).await.unwrap();
        let used = forwarder.seen.lock().unwrap()[0];
        let destination = route.cluster().destinations().find(used).cloned().unwrap();
        assert_eq!(destination.concurrency(), 1);

        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(bytes, "OK");
        assert_eq!(destination.concurrency(), 0);
    }

    #[tokio::test]
    async fn preselected_destination_skips_policy() {
        let route = route(two_destinations(), None).await;
        let forwarder = FixedForwarder::new(ForwardOutcome::Success);
        let dispatcher = HttpDispatcher::new(forwarder.clone(), Arc::new(Counts::default()));
        let chosen = route.cluster().destinations().get(1).cloned().unwrap();

        for _ in 0..3 {
            let mut req = request();
            req.extensions_mut().insert(PreselectedDestination(chosen.clone()));
            dispatcher.dispatch(req, peer(), &route).await.unwrap();
        }
        assert!(forwarder.seen.lock().unwrap().iter().all(|e| *e == chosen.endpoint()));
    }

    #[tokio::test]
    async fn affinity_header_is_attached() {
        let mut cluster = two_destinations();
        cluster.session_affinity = Some(SessionAffinityConfig {
            name: "X-Affinity".into(),
            transport: crate::config::AffinityTransport::Header,
            encoding: crate::config::AffinityEncoding::Address,
            encrypt: false,
            key: None,
            cookie_path: None,
        });
        let route = route(cluster, None).await;
        let dispatcher = HttpDispatcher::new(FixedForwarder::new(ForwardOutcome::Success), Arc::new(Counts::default()));

        let response = dispatcher.dispatch(request(), peer(), &route).await.unwrap();
        assert_eq!(response.headers()["x-affinity"], "127.0.0.1:7101");
    }

    #[tokio::test]
    async fn rejected_lease_never_reaches_forwarder() {
        let limit = RateLimitConfig {
            permit_limit: 1,
            ..RateLimitConfig::default()
        };
        let route = route(two_destinations(), Some(limit)).await;
        let forwarder = FixedForwarder::new(ForwardOutcome::Success);
        let dispatcher = HttpDispatcher::new(forwarder.clone(), Arc::new(Counts::default()));

        // First response body still holds the only permit.
        let held = dispatcher.dispatch(request(), peer(), &route).await.unwrap();
        let err = dispatcher.dispatch(request(), peer(), &route).await.unwrap_err();
        assert!(matches!(err, DispatchError::RateLimited { .. }));
        assert_eq!(forwarder.seen.lock().unwrap().len(), 1);

        drop(held);
        assert!(dispatcher.dispatch(request(), peer(), &route).await.is_ok());
    }

    #[tokio::test]
    async fn hyper_forwarder_reaches_live_backend() {
        use axum::routing::get;

        let app = axum::Router::new().route(
            "/hello",
            get(|headers: axum::http::HeaderMap| async move {
                headers
                    .get("x-forwarded-proto")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("none")
                    .to_string()
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let route = route(ClusterConfig::new("live", vec![DestinationConfig::new(addr.to_string())]), None).await;
        let reporter = Arc::new(Counts::default());
        let dispatcher = HttpDispatcher::new(Arc::new(HyperForwarder::new()), reporter.clone());

        let req = Request::builder().uri("/hello").body(Body::empty()).unwrap();
        let response = dispatcher.dispatch(req, peer(), &route).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(body, "http");
        assert_eq!(reporter.successes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hyper_forwarder_classifies_refused_connection() {
        // Bind then drop to get a port nothing listens on.
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let destination = DestinationState::detached(addr);
        let (outcome, response) = HyperForwarder::new()
            .send(request(), &destination, Duration::from_secs(2))
            .await;
        assert_eq!(outcome, ForwardOutcome::RequestFailed);
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
