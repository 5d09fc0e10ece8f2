//! Active health probe policies.
//!
//! # Policies
//! - `Connect`: open a transport connection and drop it immediately
//! - `Http`: send GET/HEAD to the configured path, expect a 2xx status
//!
//! # Design Decisions
//! - Probes are resolved by name once, when the monitor is built
//! - A probe never updates health itself; it only reports pass/fail

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use url::Url;

use crate::cluster::DestinationState;
use crate::config::ActiveHealthCheckConfig;
use crate::net::connector::Connector;

pub const CONNECT: &str = "Connect";
pub const HTTP: &str = "Http";

const KNOWN_PROBES: [&str; 2] = [CONNECT, HTTP];

/// Whether `name` is a built-in probe policy.
pub fn is_known_probe(name: &str) -> bool {
    KNOWN_PROBES.iter().any(|p| p.eq_ignore_ascii_case(name))
}

/// Why a probe failed.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("connect failed: {0}")]
    Connect(#[from] std::io::Error),

    #[error("unexpected status {0}")]
    Status(StatusCode),

    #[error("request failed: {0}")]
    Request(String),

    #[error("probe timed out")]
    Timeout,
}

/// One out-of-band health check against a destination.
#[async_trait]
pub trait ActiveHealthProbe: Send + Sync {
    fn name(&self) -> &'static str;

    async fn probe(
        &self,
        destination: &DestinationState,
        config: &ActiveHealthCheckConfig,
    ) -> Result<(), ProbeError>;
}

/// Opens and aborts a transport connection.
pub struct ConnectProbe {
    connector: Arc<dyn Connector>,
}

impl ConnectProbe {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }
}

#[async_trait]
impl ActiveHealthProbe for ConnectProbe {
    fn name(&self) -> &'static str {
        CONNECT
    }

    async fn probe(
        &self,
        destination: &DestinationState,
        config: &ActiveHealthCheckConfig,
    ) -> Result<(), ProbeError> {
        let stream = self
            .connector
            .connect(destination.endpoint(), config.timeout())
            .await?;
        drop(stream);
        Ok(())
    }
}

/// Issues an HTTP request and checks for a success status.
pub struct HttpProbe {
    client: Client<HttpConnector, Body>,
}

impl HttpProbe {
    pub fn new() -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self { client }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActiveHealthProbe for HttpProbe {
    fn name(&self) -> &'static str {
        HTTP
    }

    async fn probe(
        &self,
        destination: &DestinationState,
        config: &ActiveHealthCheckConfig,
    ) -> Result<(), ProbeError> {
        let url = Url::parse(&format!("http://{}", destination.endpoint()))
            .and_then(|base| base.join(&config.path))
            .map_err(|e| ProbeError::Request(e.to_string()))?;
        let method = Method::from_bytes(config.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| ProbeError::Request(e.to_string()))?;

        let mut builder = Request::builder()
            .method(method)
            .uri(url.as_str())
            .header(header::USER_AGENT, "dispatch-proxy-health-check");
        if let Some(host) = destination.host() {
            builder = builder.header(header::HOST, host);
        }
        let request = builder
            .body(Body::empty())
            .map_err(|e| ProbeError::Request(e.to_string()))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| ProbeError::Request(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ProbeError::Status(status))
        }
    }
}

/// Probe policies by (case-insensitive) name.
#[derive(Clone)]
pub struct ProbeRegistry {
    probes: HashMap<String, Arc<dyn ActiveHealthProbe>>,
}

impl ProbeRegistry {
    /// Registry with the built-in `Connect` and `Http` probes.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        let mut registry = Self {
            probes: HashMap::new(),
        };
        registry.register(Arc::new(ConnectProbe::new(connector)));
        registry.register(Arc::new(HttpProbe::new()));
        registry
    }

    /// Add or replace a probe under its own name.
    pub fn register(&mut self, probe: Arc<dyn ActiveHealthProbe>) {
        self.probes.insert(probe.name().to_ascii_lowercase(), probe);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActiveHealthProbe>> {
        self.probes.get(&name.to_ascii_lowercase()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connector::TcpConnector;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn names_are_case_insensitive() {
        assert!(is_known_probe("connect"));
        assert!(is_known_probe("HTTP"));
        assert!(!is_known_probe("Ping"));

        let registry = ProbeRegistry::new(Arc::new(TcpConnector::default()));
        assert_eq!(registry.get("http").unwrap().name(), HTTP);
        assert!(registry.get("grpc").is_none());
    }

    #[tokio::test]
    async fn connect_probe_passes_on_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dest = DestinationState::detached(listener.local_addr().unwrap());
        let probe = ConnectProbe::new(Arc::new(TcpConnector::default()));
        assert!(probe.probe(&dest, &ActiveHealthCheckConfig::default()).await.is_ok());
    }

    #[tokio::test]
    async fn http_probe_checks_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                    .await;
            }
        });

        let dest = DestinationState::detached(addr);
        let config = ActiveHealthCheckConfig {
            policy: HTTP.into(),
            path: "/healthz".into(),
            ..Default::default()
        };
        let err = HttpProbe::new().probe(&dest, &config).await.unwrap_err();
        assert!(matches!(err, ProbeError::Status(StatusCode::SERVICE_UNAVAILABLE)));
    }
}
