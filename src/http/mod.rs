//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request ID and trace layers)
//!     → routing::Router (host and path matching)
//!     → dispatch::http (admission, destination pick, forward)
//!     → Send to client
//! ```

pub mod request;
pub mod server;

pub use request::{ProxyRequestId, RequestIdExt, X_REQUEST_ID};
pub use server::HttpServer;
