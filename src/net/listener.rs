//! TCP listener with backpressure.
//!
//! # Responsibilities
//! - Bind to the configured address
//! - Accept incoming TCP connections
//! - Enforce max_connections via semaphore
//! - Hand each connection to the TCP dispatcher for the listener's route
//! - Stop accepting on shutdown and drain live connections

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::ListenerConfig;
use crate::lifecycle::{ProxyRuntime, Shutdown};
use crate::net::connection::ConnectionTracker;

/// How long a stopping listener waits for open connections.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause after an accept error (e.g. EMFILE) before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to accept: {0}")]
    Accept(#[from] io::Error),

    #[error("connection limit closed")]
    Closed,
}

/// A bounded TCP listener.
///
/// When `max_connections` is reached, accepting waits until a slot frees up.
pub struct Listener {
    inner: TcpListener,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
    tracker: ConnectionTracker,
}

impl Listener {
    pub async fn bind(config: &ListenerConfig) -> io::Result<Self> {
        let inner = TcpListener::bind(config.bind_address.as_str()).await?;

        tracing::debug!(
            listener = %config.name,
            address = %inner.local_addr()?,
            max_connections = config.max_connections,
            "TCP listener bound"
        );

        Ok(Self {
            inner,
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            max_connections: config.max_connections,
            tracker: ConnectionTracker::new(),
        })
    }

    /// Accept a connection once a slot is free.
    ///
    /// The permit must be held for the connection's lifetime.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, OwnedSemaphorePermit), ListenerError> {
        // Slot first, so a full listener stops draining the kernel backlog.
        let permit = self
            .connection_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ListenerError::Closed)?;

        let (stream, addr) = self.inner.accept().await?;

        tracing::debug!(
            peer_addr = %addr,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, addr, permit))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Accept until shutdown, proxying every connection over the
    /// listener's current route.
    pub async fn serve(self, name: Arc<str>, runtime: Arc<ProxyRuntime>, shutdown: Shutdown) {
        let mut stop = shutdown.subscribe();
        if shutdown.is_triggered() {
            return;
        }

        loop {
            let accepted = tokio::select! {
                _ = stop.recv() => break,
                accepted = self.accept() => accepted,
            };

            let (stream, peer, permit) = match accepted {
                Ok(accepted) => accepted,
                Err(ListenerError::Closed) => break,
                Err(e) => {
                    tracing::warn!(listener = %name, error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let guard = self.tracker.track(peer);
            let runtime = runtime.clone();
            let name = name.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let Some(route) = runtime.stream_route(&name) else {
                    tracing::warn!(listener = %name, peer = %peer, "No route for listener, closing connection");
                    return;
                };

                match runtime.tcp().proxy(stream, peer, &route).await {
                    Ok(summary) => tracing::debug!(
                        connection_id = %guard.id(),
                        route = %route.id(),
                        destination = %summary.destination,
                        attempts = summary.attempts,
                        bytes_upstream = summary.bytes_upstream,
                        bytes_downstream = summary.bytes_downstream,
                        "TCP connection finished"
                    ),
                    Err(e) => tracing::warn!(
                        connection_id = %guard.id(),
                        route = %route.id(),
                        peer = %peer,
                        error = %e,
                        "TCP connection failed"
                    ),
                }
            });
        }

        let remaining = self.tracker.drain(DRAIN_TIMEOUT).await;
        tracing::info!(listener = %name, remaining, "TCP listener stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;

    fn config(max_connections: usize) -> ListenerConfig {
        ListenerConfig {
            name: "test".into(),
            protocol: Protocol::Tcp,
            bind_address: "127.0.0.1:0".into(),
            max_connections,
        }
    }

    #[tokio::test]
    async fn permits_track_open_connections() {
        let listener = Listener::bind(&config(2)).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let (_stream, _peer, permit) = listener.accept().await.unwrap();
        assert_eq!(listener.available_permits(), 1);

        drop(permit);
        assert_eq!(listener.available_permits(), 2);
        assert_eq!(listener.max_connections(), 2);
    }

    #[tokio::test]
    async fn full_listener_waits_for_a_slot() {
        let listener = Listener::bind(&config(1)).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let _first = TcpStream::connect(addr).await.unwrap();
        let (_stream, _peer, permit) = listener.accept().await.unwrap();
        let _second = TcpStream::connect(addr).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), listener.accept()).await;
        assert!(blocked.is_err());

        drop(permit);
        assert!(listener.accept().await.is_ok());
    }
}
