//! Per-request selection context.
//!
//! Carries what policies may key on (route, client address, headers, cookies,
//! request items) and collects headers a policy wants added to the response.

use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

#[derive(Debug)]
pub struct RequestContext {
    route_id: Arc<str>,
    remote_addr: Option<SocketAddr>,
    headers: HeaderMap,
    items: HashMap<String, String>,
    response_headers: HeaderMap,
}

impl RequestContext {
    pub fn new(route_id: Arc<str>) -> Self {
        Self {
            route_id,
            remote_addr: None,
            headers: HeaderMap::new(),
            items: HashMap::new(),
            response_headers: HeaderMap::new(),
        }
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Value of cookie `name` from the request's Cookie headers.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v)
    }

    pub fn item(&self, name: &str) -> Option<&str> {
        self.items.get(name).map(String::as_str)
    }

    pub fn insert_item(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.items.insert(name.into(), value.into());
    }

    /// Client IP: first `X-Forwarded-For` entry, else the peer address.
    pub fn client_ip(&self) -> Option<IpAddr> {
        self.header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse().ok())
            .or_else(|| self.remote_addr.map(|a| a.ip()))
    }

    pub fn append_response_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.response_headers.append(name, value);
    }

    pub fn response_headers(&self) -> &HeaderMap {
        &self.response_headers
    }

    pub fn take_response_headers(&mut self) -> HeaderMap {
        std::mem::take(&mut self.response_headers)
    }
}
