//! Outbound transport connections.
//!
//! # Responsibilities
//! - Open a bidirectional byte stream to a destination endpoint
//! - Bound every attempt by a timeout
//!
//! # Design Decisions
//! - A trait object so TCP dispatch and the "Connect" probe can be tested
//!   without real sockets
//! - Timeouts surface as `io::ErrorKind::TimedOut`

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// A bidirectional byte stream.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

pub type BoxedStream = Box<dyn Stream>;

/// Opens transport connections to destinations.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: SocketAddr, timeout: Duration) -> io::Result<BoxedStream>;
}

/// Plain TCP connector.
#[derive(Debug, Default, Clone)]
pub struct TcpConnector {
    nodelay: bool,
}

impl TcpConnector {
    pub fn new(nodelay: bool) -> Self {
        Self { nodelay }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: SocketAddr, timeout: Duration) -> io::Result<BoxedStream> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("connect to {} timed out", endpoint)))??;
        if self.nodelay {
            stream.set_nodelay(true)?;
        }
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connects_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connector = TcpConnector::new(true);
        assert!(connector.connect(addr, Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn refused_connection_is_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let connector = TcpConnector::default();
        assert!(connector.connect(addr, Duration::from_secs(1)).await.is_err());
    }
}
