//! TCP dispatch: connect with bounded retry, then relay.
//!
//! # Connection Lifecycle
//! ```text
//! accepted ──► admit ──► middleware init ──► attempt 1..=retry_count+1
//!                                              │ pick → track → connect
//!                                              │ fail: report, re-pick
//!                                              ▼
//!                                           connected: report success
//!                                              │
//!                                              ▼
//!           relay both ways until one side ends, route timeout or shutdown
//! ```

use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::cluster::ConcurrencyGuard;
use crate::dispatch::middleware::{apply, Direction, TcpMiddleware};
use crate::dispatch::{admit, report, DispatchError};
use crate::health::HealthReporter;
use crate::lifecycle::Shutdown;
use crate::load_balancer::{pick_destination, RequestContext};
use crate::net::connector::{BoxedStream, Connector};
use crate::observability::metrics;
use crate::routing::RouteState;

const RELAY_BUFFER: usize = 16 * 1024;

/// Result of a completed TCP exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpSummary {
    pub destination: SocketAddr,
    pub attempts: u32,
    pub bytes_upstream: u64,
    pub bytes_downstream: u64,
}

pub struct TcpDispatcher {
    connector: Arc<dyn Connector>,
    reporter: Arc<dyn HealthReporter>,
    middleware: Vec<Arc<dyn TcpMiddleware>>,
    connect_timeout: Duration,
    shutdown: Shutdown,
}

impl TcpDispatcher {
    pub fn new(
        connector: Arc<dyn Connector>,
        reporter: Arc<dyn HealthReporter>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            reporter,
            middleware: Vec::new(),
            connect_timeout,
            shutdown: Shutdown::new(),
        }
    }

    /// Close in-flight relays when `shutdown` fires.
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_middleware(mut self, middleware: Arc<dyn TcpMiddleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Proxy one client connection over `route`.
    pub async fn proxy<S>(&self, client: S, peer: SocketAddr, route: &RouteState) -> Result<TcpSummary, DispatchError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let start = Instant::now();
        let result = self.exchange(client, peer, route).await;
        let status = match &result {
            Ok(_) => 200,
            Err(e) => e.status().as_u16(),
        };
        metrics::record_request("tcp", route.cluster().id(), status, start);
        result
    }

    async fn exchange<S>(&self, client: S, peer: SocketAddr, route: &RouteState) -> Result<TcpSummary, DispatchError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut ctx = RequestContext::new(route.id_arc()).with_remote_addr(peer);
        let _lease = admit(route, &ctx).await?;

        for m in &self.middleware {
            m.init(&mut ctx).await?;
        }

        let (guard, upstream, attempts) = self.connect(&mut ctx, route).await?;
        let destination = guard.endpoint();

        let mut up = 0u64;
        let mut down = 0u64;
        let relay = relay(client, upstream, &self.middleware, &mut up, &mut down);
        tokio::select! {
            relayed = tokio::time::timeout(route.timeout(), relay) => match relayed {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(
                    route = route.id(),
                    destination = %destination,
                    error = %e,
                    "Relay ended with error"
                ),
                Err(_) => {
                    return Err(DispatchError::Timeout {
                        route: route.id().to_string(),
                        timeout: route.timeout(),
                    })
                }
            },
            _ = self.shutdown.wait() => {
                debug!(route = route.id(), destination = %destination, "Relay closed by shutdown");
            }
        }

        Ok(TcpSummary {
            destination,
            attempts,
            bytes_upstream: up,
            bytes_downstream: down,
        })
    }

    /// Connect to a destination, re-picking on each failed attempt.
    async fn connect(
        &self,
        ctx: &mut RequestContext,
        route: &RouteState,
    ) -> Result<(ConcurrencyGuard, BoxedStream, u32), DispatchError> {
        let cluster = route.cluster();
        let max_attempts = route.retry_count().saturating_add(1);
        let timeout = self.connect_timeout.min(route.timeout());
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            let Some(destination) = pick_destination(ctx, cluster) else {
                return Err(match last_error {
                    Some(source) => DispatchError::ConnectFailed {
                        cluster: cluster.id().to_string(),
                        attempts: attempt - 1,
                        source,
                    },
                    None => DispatchError::NoAvailableDestination {
                        cluster: cluster.id().to_string(),
                    },
                });
            };

            let guard = destination.track();
            match self.connector.connect(destination.endpoint(), timeout).await {
                Ok(stream) => {
                    report(self.reporter.as_ref(), &destination, true);
                    metrics::record_connect_attempt(cluster.id(), true);
                    info!(
                        route = route.id(),
                        cluster = cluster.id(),
                        destination = %destination.endpoint(),
                        attempt,
                        "Connected to destination"
                    );
                    return Ok((guard, stream, attempt));
                }
                Err(e) => {
                    report(self.reporter.as_ref(), &destination, false);
                    metrics::record_connect_attempt(cluster.id(), false);
                    warn!(
                        route = route.id(),
                        cluster = cluster.id(),
                        destination = %destination.endpoint(),
                        attempt,
                        max_attempts,
                        error = %e,
                        "Connect failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(DispatchError::ConnectFailed {
            cluster: cluster.id().to_string(),
            attempts: max_attempts,
            source: last_error.unwrap_or_else(|| io::Error::other("no connect attempt made")),
        })
    }
}

/// Copy both ways until either direction finishes.
async fn relay<C, U>(
    client: C,
    upstream: U,
    chain: &[Arc<dyn TcpMiddleware>],
    up: &mut u64,
    down: &mut u64,
) -> io::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    U: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut client_r, mut client_w) = tokio::io::split(client);
    let (mut upstream_r, mut upstream_w) = tokio::io::split(upstream);

    tokio::select! {
        r = pipe(&mut client_r, &mut upstream_w, chain, Direction::Upstream, up) => r,
        r = pipe(&mut upstream_r, &mut client_w, chain, Direction::Downstream, down) => r,
    }
}

async fn pipe<R, W>(
    reader: &mut R,
    writer: &mut W,
    chain: &[Arc<dyn TcpMiddleware>],
    direction: Direction,
    copied: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(RELAY_BUFFER);
    loop {
        buf.reserve(RELAY_BUFFER);
        if reader.read_buf(&mut buf).await? == 0 {
            writer.shutdown().await?;
            return Ok(());
        }
        let data = apply(chain, direction, buf.split().freeze())?;
        writer.write_all(&data).await?;
        writer.flush().await?;
        *copied += data.len() as u64;
    }
}
