//! Connection lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Count live connections per listener
//! - Let a stopping listener wait for its connections to drain

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Relaxed ordering is enough, IDs only need to be unique.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Default)]
struct Counter {
    active: AtomicU64,
    idle: Notify,
}

/// Counts live connections so a listener can drain on shutdown.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    counter: Arc<Counter>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new connection from `peer`. The guard releases it on drop.
    pub fn track(&self, peer: SocketAddr) -> ConnectionGuard {
        self.counter.active.fetch_add(1, Ordering::SeqCst);
        let id = ConnectionId::new();
        tracing::trace!(connection_id = %id, peer = %peer, "Connection opened");
        ConnectionGuard {
            counter: Arc::clone(&self.counter),
            id,
            peer,
        }
    }

    pub fn active_count(&self) -> u64 {
        self.counter.active.load(Ordering::SeqCst)
    }

    /// Wait until every tracked connection closed or `timeout` elapsed.
    ///
    /// Returns the number of connections still open.
    pub async fn drain(&self, timeout: Duration) -> u64 {
        let wait = async {
            loop {
                let idle = self.counter.idle.notified();
                if self.active_count() == 0 {
                    return;
                }
                idle.await;
            }
        };
        let _ = tokio::time::timeout(timeout, wait).await;
        self.active_count()
    }
}

/// Tracks one connection's lifetime.
#[derive(Debug)]
pub struct ConnectionGuard {
    counter: Arc<Counter>,
    id: ConnectionId,
    peer: SocketAddr,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.counter.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.counter.idle.notify_waiters();
        }
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn connection_id_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn connection_tracker_counts() {
        let tracker = ConnectionTracker::new();
        let first = tracker.track(peer());
        let second = tracker.track(peer());
        assert_eq!(tracker.active_count(), 2);

        drop(first);
        assert_eq!(tracker.active_count(), 1);
        drop(second);
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_last_connection() {
        let tracker = ConnectionTracker::new();
        let guard = tracker.track(peer());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            drop(guard);
        });

        assert_eq!(tracker.drain(Duration::from_secs(10)).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_gives_up_after_timeout() {
        let tracker = ConnectionTracker::new();
        let _guard = tracker.track(peer());
        assert_eq!(tracker.drain(Duration::from_secs(1)).await, 1);
    }
}
