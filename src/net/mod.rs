//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! TCP: listener.rs (accept loop, connection limit)
//!     → connection.rs (lifecycle tracking, drain)
//!     → dispatch::tcp (pick, connect, relay via connector.rs)
//!
//! UDP: datagram.rs (receive loop)
//!     → dispatch::udp (one exchange per datagram)
//! ```
//!
//! # Design Decisions
//! - Bounded accept prevents resource exhaustion
//! - Each TCP connection tracked for graceful shutdown
//! - Outbound connections go through the `Connector` seam so tests and
//!   probes can substitute transports

pub mod connection;
pub mod connector;
pub mod datagram;
pub mod listener;
