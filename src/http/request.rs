//! Request correlation.
//!
//! # Responsibilities
//! - Name the request ID header shared by every layer
//! - Read the ID assigned by the request-id middleware
//!
//! # Design Decisions
//! - IDs are assigned before routing so even 404s are traceable
//! - An ID supplied by the client is kept, not replaced

use axum::http::{HeaderName, HeaderValue, Request};
use tower_http::request_id::{MakeRequestId, RequestId};
use uuid::Uuid;

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Assigns a UUID v4 to requests that arrive without an ID.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProxyRequestId;

impl MakeRequestId for ProxyRequestId {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Uuid::new_v4().to_string())
            .ok()
            .map(RequestId::new)
    }
}

/// Access to the request ID set by `SetRequestIdLayer`.
pub trait RequestIdExt {
    fn request_id(&self) -> Option<&str>;
}

impl<B> RequestIdExt for Request<B> {
    fn request_id(&self) -> Option<&str> {
        self.extensions()
            .get::<RequestId>()
            .and_then(|id| id.header_value().to_str().ok())
            .or_else(|| self.headers().get(X_REQUEST_ID).and_then(|v| v.to_str().ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn prefers_extension_over_header() {
        let mut request = Request::builder()
            .header(X_REQUEST_ID, "from-header")
            .body(())
            .unwrap();
        assert_eq!(request.request_id(), Some("from-header"));

        request
            .extensions_mut()
            .insert(RequestId::new(HeaderValue::from_static("from-layer")));
        assert_eq!(request.request_id(), Some("from-layer"));
    }

    #[test]
    fn generated_ids_are_uuids() {
        let request = Request::builder().body(()).unwrap();
        let id = ProxyRequestId.make_request_id(&request).unwrap();
        let text = id.header_value().to_str().unwrap();
        assert!(Uuid::parse_str(text).is_ok());
    }

    #[test]
    fn missing_id() {
        let request = Request::builder().body(()).unwrap();
        assert_eq!(request.request_id(), None);
    }
}
