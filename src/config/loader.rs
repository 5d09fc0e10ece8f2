//! Configuration loading from disk.

use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::config::schema::ProxyConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<ProxyConfig, ConfigError> {
    let config: ProxyConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{LimiterAlgorithm, Protocol, RateLimitPolicy};

    const SAMPLE: &str = r#"
[[listeners]]
name = "web"
protocol = "http"
bind_address = "127.0.0.1:8080"

[[listeners]]
name = "db"
protocol = "tcp"
bind_address = "127.0.0.1:5433"

[[routes]]
name = "api"
listener = "web"
path_prefix = "/api"
cluster = "api"

[routes.rate_limit]
policy = "total"
algorithm = "token_bucket"
permit_limit = 20

[[routes]]
name = "pg"
listener = "db"
cluster = "pg"
retry_count = 2

[[clusters]]
name = "api"
load_balancing_policy = "LeastRequests"
destinations = [{ address = "10.0.0.1:8080" }, { address = "10.0.0.2:8080" }]

[clusters.health_check.active]
policy = "Http"
path = "/healthz"
interval_ms = 5000
fails = 3
passes = 2

[clusters.health_check.passive]
failure_rate_limit = 0.5

[[clusters]]
name = "pg"
destinations = [{ address = "db.internal:5432" }]
dns_refresh_secs = 30
"#;

    #[test]
    fn parses_full_config() {
        let config = parse_config(SAMPLE).unwrap();
        assert_eq!(config.listeners.len(), 2);
        assert_eq!(config.listeners[1].protocol, Protocol::Tcp);

        let limit = config.routes[0].rate_limit.as_ref().unwrap();
        assert_eq!(limit.policy, RateLimitPolicy::Total);
        assert_eq!(limit.algorithm, LimiterAlgorithm::TokenBucket);
        assert_eq!(limit.permit_limit, 20);
        assert_eq!(config.routes[1].retry_count, 2);
        assert_eq!(config.routes[1].udp_response_count, 1);

        let active = config.clusters[0].health_check.active.as_ref().unwrap();
        assert_eq!(active.fails, 3);
        assert_eq!(active.timeout_ms, 5_000);
        assert_eq!(config.clusters[1].load_balancing_policy, "RoundRobin");
    }

    #[test]
    fn rejects_unknown_policy() {
        let broken = SAMPLE.replace("LeastRequests", "Fastest");
        match parse_config(&broken) {
            Err(ConfigError::Validation(errors)) => {
                assert!(errors
                    .iter()
                    .any(|e| matches!(e, ValidationError::UnknownLoadBalancingPolicy { .. })));
            }
            other => panic!("expected validation failure, got {:?}", other),
        }
    }
}
