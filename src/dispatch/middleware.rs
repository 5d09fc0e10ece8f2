//! TCP middleware chain.
//!
//! Middleware sees a connection once before the destination is chosen
//! (`init`) and then every chunk relayed in either direction. Upstream
//! chunks pass through the chain in order, downstream chunks in reverse.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Debug;
use std::io;
use std::sync::Arc;

use crate::load_balancer::RequestContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to destination.
    Upstream,
    /// Destination to client.
    Downstream,
}

#[async_trait]
pub trait TcpMiddleware: Send + Sync + Debug {
    /// Runs before admission is turned into a connection. An error closes
    /// the client connection without contacting any destination.
    async fn init(&self, _ctx: &mut RequestContext) -> io::Result<()> {
        Ok(())
    }

    fn on_data(&self, _direction: Direction, data: Bytes) -> io::Result<Bytes> {
        Ok(data)
    }
}

/// Run `data` through the chain for one direction.
pub(crate) fn apply(chain: &[Arc<dyn TcpMiddleware>], direction: Direction, mut data: Bytes) -> io::Result<Bytes> {
    match direction {
        Direction::Upstream => {
            for m in chain {
                data = m.on_data(direction, data)?;
            }
        }
        Direction::Downstream => {
            for m in chain.iter().rev() {
                data = m.on_data(direction, data)?;
            }
        }
    }
    Ok(data)
}
