//! HTTP listener front end.
//!
//! # Responsibilities
//! - Build the Axum service for one listener
//! - Wire up middleware (request ID, tracing)
//! - Match each request against the listener's routes
//! - Hand matched requests to the HTTP dispatcher
//! - Stop accepting on shutdown and let in-flight requests finish
//!
//! # Design Decisions
//! - A single fallback handler; routing is the proxy's own, not Axum's
//! - The router is looked up per request so reloads apply immediately

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::http::request::{ProxyRequestId, RequestIdExt, X_REQUEST_ID};
use crate::lifecycle::{ProxyRuntime, Shutdown};

/// State injected into the proxy handler.
#[derive(Clone)]
struct AppState {
    runtime: Arc<ProxyRuntime>,
    listener: Arc<str>,
}

/// HTTP server for one listener.
pub struct HttpServer {
    router: Router,
    listener: Arc<str>,
}

impl HttpServer {
    pub fn new(runtime: Arc<ProxyRuntime>, listener: Arc<str>) -> Self {
        let state = AppState {
            runtime,
            listener: listener.clone(),
        };
        Self {
            router: Self::build_router(state),
            listener,
        }
    }

    fn build_router(state: AppState) -> Router {
        Router::new()
            .fallback(proxy_handler)
            .with_state(state)
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::new(X_REQUEST_ID, ProxyRequestId))
                    .layer(TraceLayer::new_for_http())
                    .layer(PropagateRequestIdLayer::new(X_REQUEST_ID)),
            )
    }

    /// Serve until `shutdown` fires, then drain in-flight requests.
    pub async fn run(self, listener: TcpListener, shutdown: Shutdown) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::debug!(listener = %self.listener, address = %addr, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        let mut stop = shutdown.subscribe();
        let triggered = shutdown.is_triggered();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                if !triggered {
                    let _ = stop.recv().await;
                }
            })
            .await?;

        tracing::info!(listener = %self.listener, "HTTP server stopped");
        Ok(())
    }
}

async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let request_id = request.request_id().unwrap_or("unknown").to_string();

    let Some(router) = state.runtime.http_router(&state.listener) else {
        return (StatusCode::NOT_FOUND, "No matching route found").into_response();
    };

    let (parts, body) = request.into_parts();
    let Some(route) = router.route(&parts) else {
        tracing::debug!(request_id = %request_id, path = %parts.uri.path(), "No route matched");
        return (StatusCode::NOT_FOUND, "No matching route found").into_response();
    };

    tracing::debug!(
        request_id = %request_id,
        route = %route.id(),
        method = %parts.method,
        path = %parts.uri.path(),
        "Proxying request"
    );

    let request = Request::from_parts(parts, body);
    match state.runtime.http().dispatch(request, peer, &route).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(request_id = %request_id, route = %route.id(), error = %e, "Dispatch failed");
            e.into_response()
        }
    }
}
