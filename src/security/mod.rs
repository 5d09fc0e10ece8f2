//! Admission control and forwarding header hygiene.
//!
//! # Data Flow
//! ```text
//! Incoming connection/request:
//!     → rate_limit.rs (pick the route's limiter for this request)
//!     → limiters.rs (acquire a lease; reject → 429 / close)
//!     → dispatch
//!     → headers.rs (strip hop-by-hop, add X-Forwarded-*) for HTTP
//!     → lease dropped on every exit path
//! ```
//!
//! # Design Decisions
//! - Fail closed: a rejected lease never reaches a destination
//! - Release is tied to ownership, never to explicit calls
//! - No trust in client input beyond the first X-Forwarded-For entry

pub mod headers;
pub mod limiters;
pub mod rate_limit;

pub use limiters::{Lease, RateLimiter};
pub use rate_limit::RouteRateLimiter;
