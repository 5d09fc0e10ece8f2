//! Multi-protocol dispatch proxy library.
//!
//! Forwards HTTP requests, TCP connections and UDP datagrams from clients
//! to backend destinations grouped into clusters.
//!
//! # Architecture Overview
//!
//! ```text
//!                  ┌───────────────────────────────────────────────────────┐
//!   Client         │  ┌──────────┐   ┌─────────┐   ┌──────────────────┐    │
//!   ───────────────┼─▶│ net/http │──▶│ routing │──▶│     dispatch     │────┼──▶ Destination
//!                  │  │ listener │   │ matcher │   │ admit/pick/relay │    │
//!                  │  └──────────┘   └─────────┘   └────────┬─────────┘    │
//!                  │                                        │              │
//!                  │            ┌───────────────┬───────────┴──┐           │
//!                  │            ▼               ▼              ▼           │
//!                  │     ┌─────────────┐ ┌─────────────┐ ┌──────────┐      │
//!                  │     │load_balancer│ │   security  │ │  health  │      │
//!                  │     │  policies   │ │ rate limits │ │ reports  │      │
//!                  │     └──────┬──────┘ └─────────────┘ └────┬─────┘      │
//!                  │            ▼                             ▼            │
//!                  │     ┌──────────────────────────────────────────┐      │
//!                  │     │ cluster state ◀── resolver (static/DNS)  │      │
//!                  │     └──────────────────────────────────────────┘      │
//!                  │                                                       │
//!                  │  config · lifecycle · observability                   │
//!                  └───────────────────────────────────────────────────────┘
//! ```

// Core subsystems
pub mod config;
pub mod http;
pub mod net;
pub mod routing;
pub mod dispatch;

// Traffic management
pub mod cluster;
pub mod health;
pub mod load_balancer;
pub mod resolver;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod security;

pub use config::schema::ProxyConfig;
pub use http::HttpServer;
pub use lifecycle::{ProxyRuntime, Shutdown};
