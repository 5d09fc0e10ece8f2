//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Signal received → broadcast → listeners, probe loops and
//!     refresh loops exit → in-flight exchanges finish or are dropped
//!
//! Startup (startup.rs):
//!     Validate config → build clusters → resolve destinations →
//!     schedule health checks → bind listeners
//!
//! Signals (signals.rs):
//!     SIGINT/Ctrl+C → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - One broadcast channel; every background task subscribes
//! - Background tasks also exit when the state they serve is gone

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use startup::{BoundListener, Components, ProxyRuntime, StartupError};
