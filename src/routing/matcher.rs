//! Route matching logic.
//!
//! # Responsibilities
//! - Match host header (exact match, case-insensitive, port ignored)
//! - Match path prefix (case-sensitive)
//! - Combine conditions with AND semantics
//!
//! # Design Decisions
//! - Host matching is case-insensitive (RFC 9110)
//! - Path matching is case-sensitive
//! - Empty condition = always matches (wildcard)
//! - No regex to guarantee O(n) matching

use axum::http::header;
use axum::http::request::Parts;

/// Trait for matching requests against conditions.
pub trait Matcher: Send + Sync + std::fmt::Debug {
    /// Returns true if the request matches this condition.
    fn matches(&self, req: &Parts) -> bool;
}

/// Matches the Host header, or the URI authority for absolute-form requests.
#[derive(Debug, Clone)]
pub struct HostMatcher {
    expected_host: String,
}

impl HostMatcher {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            expected_host: host.into().to_lowercase(),
        }
    }
}

fn request_host(req: &Parts) -> Option<&str> {
    req.headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri.host())
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        // A colon inside the name without brackets is a bare IPv6 literal.
        Some((name, port))
            if (!name.contains(':') || name.ends_with(']'))
                && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            name
        }
        _ => host,
    }
}

impl Matcher for HostMatcher {
    fn matches(&self, req: &Parts) -> bool {
        request_host(req)
            .map(|h| strip_port(h).eq_ignore_ascii_case(&self.expected_host))
            .unwrap_or(false)
    }
}

/// Matches the request path prefix.
#[derive(Debug, Clone)]
pub struct PathPrefixMatcher {
    prefix: String,
}

impl PathPrefixMatcher {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Matcher for PathPrefixMatcher {
    fn matches(&self, req: &Parts) -> bool {
        req.uri.path().starts_with(&self.prefix)
    }
}

/// Combines multiple matchers with AND semantics.
#[derive(Debug, Default)]
pub struct AndMatcher {
    matchers: Vec<Box<dyn Matcher>>,
}

impl AndMatcher {
    pub fn new(matchers: Vec<Box<dyn Matcher>>) -> Self {
        Self { matchers }
    }
}

impl Matcher for AndMatcher {
    fn matches(&self, req: &Parts) -> bool {
        self.matchers.iter().all(|m| m.matches(req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(uri: &str, host: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri(uri);
        if let Some(host) = host {
            builder = builder.header("Host", host);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_host_matcher() {
        let matcher = HostMatcher::new("example.com");

        assert!(matcher.matches(&parts("/", Some("example.com"))));
        assert!(matcher.matches(&parts("/", Some("EXAMPLE.COM")))); // Case insensitive
        assert!(matcher.matches(&parts("/", Some("example.com:8080"))));
        assert!(!matcher.matches(&parts("/", Some("other.com"))));
        assert!(!matcher.matches(&parts("/", None)));
    }

    #[test]
    fn test_path_matcher() {
        let matcher = PathPrefixMatcher::new("/api");

        assert!(matcher.matches(&parts("http://example.com/api/v1", None)));
        assert!(!matcher.matches(&parts("http://example.com/images", None)));
    }

    #[test]
    fn empty_and_matches_everything() {
        assert!(AndMatcher::default().matches(&parts("/anything", None)));
    }
}
