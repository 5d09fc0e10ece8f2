//! Session affinity decorator.
//!
//! Wraps any base policy. When the request carries a token that names a
//! currently available destination, that destination is returned and the
//! base policy is skipped. Otherwise the base policy picks, and a token for
//! its choice is attached to the response.
//!
//! # Token flow
//! ```text
//! request ──► read cookie/header ──► unprotect ──► match identity ──► hit
//!                                                        │
//!                                                        ▼ miss
//!                                   base policy ──► protect ──► response header
//! ```
//!
//! # Design Decisions
//! - Destination identities are cached per endpoint; they are recomputed
//!   only for endpoints never seen before
//! - Protected tokens use AES-256-GCM with a fresh nonce per token, so the
//!   same destination yields different tokens
//! - Unreadable or tampered tokens count as absent

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use axum::http::header::{self, HeaderName, HeaderValue};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use dashmap::DashMap;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cluster::DestinationState;
use crate::config::{AffinityEncoding, AffinityTransport, SessionAffinityConfig};
use crate::load_balancer::hash::hash64;
use crate::load_balancer::{LoadBalancingPolicy, RequestContext};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum AffinityError {
    #[error("affinity key is not valid base64")]
    KeyEncoding,

    #[error("affinity key must be {KEY_LEN} bytes, got {0}")]
    KeyLength(usize),

    #[error("affinity name '{0}' is not a valid header name")]
    InvalidName(String),
}

/// Authenticated encryption for affinity tokens.
pub struct TokenProtector {
    cipher: Aes256Gcm,
}

impl fmt::Debug for TokenProtector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenProtector").finish_non_exhaustive()
    }
}

impl TokenProtector {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Build the protector an affinity config asks for, if any.
    pub fn from_config(config: &SessionAffinityConfig) -> Result<Option<Self>, AffinityError> {
        if !config.encrypt {
            return Ok(None);
        }
        let mut key = [0u8; KEY_LEN];
        match &config.key {
            Some(encoded) => {
                let bytes = STANDARD
                    .decode(encoded.trim())
                    .map_err(|_| AffinityError::KeyEncoding)?;
                if bytes.len() != KEY_LEN {
                    return Err(AffinityError::KeyLength(bytes.len()));
                }
                key.copy_from_slice(&bytes);
            }
            None => rand::thread_rng().fill_bytes(&mut key),
        }
        Ok(Some(Self::new(&key)))
    }

    pub fn protect(&self, plaintext: &str) -> Option<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self.cipher.encrypt(&nonce, plaintext.as_bytes()).ok()?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Some(URL_SAFE_NO_PAD.encode(out))
    }

    pub fn unprotect(&self, token: &str) -> Option<String> {
        let bytes = URL_SAFE_NO_PAD.decode(token).ok()?;
        if bytes.len() <= NONCE_LEN {
            return None;
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .ok()?;
        String::from_utf8(plaintext).ok()
    }
}

#[derive(Debug)]
pub struct SessionAffinityPolicy {
    inner: Arc<dyn LoadBalancingPolicy>,
    name: String,
    header_name: HeaderName,
    transport: AffinityTransport,
    encoding: AffinityEncoding,
    cookie_path: String,
    protector: Option<TokenProtector>,
    identities: DashMap<SocketAddr, Arc<str>>,
}

impl SessionAffinityPolicy {
    pub fn new(
        inner: Arc<dyn LoadBalancingPolicy>,
        config: &SessionAffinityConfig,
    ) -> Result<Self, AffinityError> {
        let header_name = HeaderName::try_from(config.name.as_str())
            .map_err(|_| AffinityError::InvalidName(config.name.clone()))?;
        Ok(Self {
            inner,
            name: config.name.clone(),
            header_name,
            transport: config.transport,
            encoding: config.encoding,
            cookie_path: config.cookie_path.clone().unwrap_or_else(|| "/".to_string()),
            protector: TokenProtector::from_config(config)?,
            identities: DashMap::new(),
        })
    }

    pub fn inner(&self) -> &Arc<dyn LoadBalancingPolicy> {
        &self.inner
    }

    /// Stable identity string for a destination under the configured encoding.
    pub fn identity(&self, destination: &DestinationState) -> Arc<str> {
        let endpoint = destination.endpoint();
        if let Some(id) = self.identities.get(&endpoint) {
            return id.clone();
        }
        let address = endpoint.to_string();
        let id: Arc<str> = match self.encoding {
            AffinityEncoding::Address => Arc::from(address),
            AffinityEncoding::Sha256 => Arc::from(hex::encode(Sha256::digest(address.as_bytes()))),
            AffinityEncoding::Hash64 => Arc::from(format!("{:016x}", hash64(&address))),
        };
        self.identities.insert(endpoint, id.clone());
        id
    }

    fn read_token(&self, ctx: &RequestContext) -> Option<String> {
        let raw = match self.transport {
            AffinityTransport::Cookie => ctx.cookie(&self.name),
            AffinityTransport::Header => ctx.header(&self.name),
        }?;
        match &self.protector {
            Some(protector) => protector.unprotect(raw),
            None => Some(raw.to_string()),
        }
    }

    fn write_token(&self, ctx: &mut RequestContext, destination: &DestinationState) {
        let identity = self.identity(destination);
        let token = match &self.protector {
            Some(protector) => match protector.protect(&identity) {
                Some(token) => token,
                None => {
                    warn!(endpoint = %destination.endpoint(), "failed to protect affinity token");
                    return;
                }
            },
            None => identity.to_string(),
        };

        let (name, value) = match self.transport {
            AffinityTransport::Cookie => (
                header::SET_COOKIE,
                format!("{}={}; Path={}; HttpOnly", self.name, token, self.cookie_path),
            ),
            AffinityTransport::Header => (self.header_name.clone(), token),
        };
        match HeaderValue::try_from(value) {
            Ok(value) => ctx.append_response_header(name, value),
            Err(_) => warn!(endpoint = %destination.endpoint(), "affinity token is not a valid header value"),
        }
    }
}

impl LoadBalancingPolicy for SessionAffinityPolicy {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn pick(
        &self,
        ctx: &mut RequestContext,
        available: &[Arc<DestinationState>],
    ) -> Option<Arc<DestinationState>> {
        if let Some(token) = self.read_token(ctx) {
            let hit = available
                .iter()
                .find(|d| *self.identity(d) == *token)
                .cloned();
            if hit.is_some() {
                return hit;
            }
            debug!(route = ctx.route_id(), "affinity token did not match an available destination");
        }

        let chosen = self.inner.pick(ctx, available)?;
        self.write_token(ctx, &chosen);
        Some(chosen)
    }

    fn evict_route(&self, route_id: &str) {
        self.inner.evict_route(route_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::round_robin::RoundRobin;
    use axum::http::HeaderMap;

    fn dests() -> Vec<Arc<DestinationState>> {
        (0..3)
            .map(|i| Arc::new(DestinationState::detached(format!("10.0.0.{}:80", i + 1).parse().unwrap())))
            .collect()
    }

    fn config(transport: AffinityTransport, encrypt: bool) -> SessionAffinityConfig {
        SessionAffinityConfig {
            name: "X-Affinity".to_string(),
            transport,
            encoding: AffinityEncoding::Sha256,
            encrypt,
            key: None,
            cookie_path: None,
        }
    }

    fn issued_token(ctx: &RequestContext, transport: AffinityTransport) -> String {
        match transport {
            AffinityTransport::Header => ctx
                .response_headers()
                .get("x-affinity")
                .unwrap()
                .to_str()
                .unwrap()
                .to_string(),
            AffinityTransport::Cookie => {
                let cookie = ctx.response_headers().get(header::SET_COOKIE).unwrap().to_str().unwrap();
                let pair = cookie.split(';').next().unwrap();
                pair.split_once('=').unwrap().1.to_string()
            }
        }
    }

    fn sticky_roundtrip(transport: AffinityTransport, encrypt: bool) {
        let policy = SessionAffinityPolicy::new(Arc::new(RoundRobin::new()), &config(transport, encrypt)).unwrap();
        let backends = dests();

        let mut first = RequestContext::new(Arc::from("r"));
        let chosen = policy.pick(&mut first, &backends).unwrap();
        let token = issued_token(&first, transport);

        for _ in 0..5 {
            let mut headers = HeaderMap::new();
            match transport {
                AffinityTransport::Header => {
                    headers.insert("x-affinity", HeaderValue::from_str(&token).unwrap());
                }
                AffinityTransport::Cookie => {
                    headers.insert(header::COOKIE, HeaderValue::from_str(&format!("X-Affinity={token}")).unwrap());
                }
            }
            let mut ctx = RequestContext::new(Arc::from("r")).with_headers(headers);
            let again = policy.pick(&mut ctx, &backends).unwrap();
            assert_eq!(again.endpoint(), chosen.endpoint());
            assert!(ctx.response_headers().is_empty());
        }
    }

    #[test]
    fn header_token_sticks() {
        sticky_roundtrip(AffinityTransport::Header, false);
    }

    #[test]
    fn encrypted_cookie_token_sticks() {
        sticky_roundtrip(AffinityTransport::Cookie, true);
    }

    #[test]
    fn unknown_token_falls_through_and_reissues() {
        let policy =
            SessionAffinityPolicy::new(Arc::new(RoundRobin::new()), &config(AffinityTransport::Header, false)).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-affinity", HeaderValue::from_static("deadbeef"));
        let mut ctx = RequestContext::new(Arc::from("r")).with_headers(headers);

        assert!(policy.pick(&mut ctx, &dests()).is_some());
        assert!(ctx.response_headers().contains_key("x-affinity"));
    }

    #[test]
    fn identities_follow_encoding() {
        let dest = DestinationState::detached("10.0.0.1:80".parse().unwrap());
        let mut cfg = config(AffinityTransport::Header, false);

        cfg.encoding = AffinityEncoding::Address;
        let p = SessionAffinityPolicy::new(Arc::new(RoundRobin::new()), &cfg).unwrap();
        assert_eq!(&*p.identity(&dest), "10.0.0.1:80");

        cfg.encoding = AffinityEncoding::Sha256;
        let p = SessionAffinityPolicy::new(Arc::new(RoundRobin::new()), &cfg).unwrap();
        assert_eq!(p.identity(&dest).len(), 64);

        cfg.encoding = AffinityEncoding::Hash64;
        let p = SessionAffinityPolicy::new(Arc::new(RoundRobin::new()), &cfg).unwrap();
        assert_eq!(p.identity(&dest).len(), 16);
    }

    #[test]
    fn protector_rejects_tampering_and_bad_keys() {
        let protector = TokenProtector::new(&[7u8; KEY_LEN]);
        let token = protector.protect("10.0.0.1:80").unwrap();
        assert_eq!(protector.unprotect(&token).as_deref(), Some("10.0.0.1:80"));
        assert!(protector.unprotect("not-a-token").is_none());

        let other = TokenProtector::new(&[8u8; KEY_LEN]);
        assert!(other.unprotect(&token).is_none());

        let mut cfg = config(AffinityTransport::Cookie, true);
        cfg.key = Some(STANDARD.encode([1u8; 16]));
        assert!(matches!(TokenProtector::from_config(&cfg), Err(AffinityError::KeyLength(16))));
        cfg.key = Some("%%%".to_string());
        assert!(matches!(TokenProtector::from_config(&cfg), Err(AffinityError::KeyEncoding)));
    }
}
