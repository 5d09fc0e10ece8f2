//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks, policy/probe names resolved)
//!     → ProxyConfig (validated, immutable)
//!     → runtime builds clusters, routes and dispatchers from it
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → runtime applies it (removed clusters are unscheduled)
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; a reload replaces it whole and
//!   reuses clusters whose settings did not change
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::*;
