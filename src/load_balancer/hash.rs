//! Consistent key hashing strategy.
//!
//! The key comes from one source (header, cookie or request item). Keys are
//! lowercased before hashing so `Tenant-A` and `tenant-a` land together.
//! Requests without a key fall back to uniform random selection.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::sync::Arc;

use crate::cluster::DestinationState;
use crate::load_balancer::random::Random;
use crate::load_balancer::{LoadBalancingPolicy, RequestContext};

/// Where the hash key is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashKey {
    Header(String),
    Cookie(String),
    Item(String),
}

#[derive(Debug)]
pub struct Hash {
    key: HashKey,
    fallback: Random,
}

impl Hash {
    pub fn new(key: HashKey) -> Self {
        Self {
            key,
            fallback: Random::new(),
        }
    }

    fn key<'a>(&self, ctx: &'a RequestContext) -> Option<&'a str> {
        let value = match &self.key {
            HashKey::Header(name) => ctx.header(name),
            HashKey::Cookie(name) => ctx.cookie(name),
            HashKey::Item(name) => ctx.item(name),
        };
        value.filter(|v| !v.is_empty())
    }
}

/// 64-bit hash of `value`, ignoring ASCII case.
pub fn hash64(value: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    for b in value.bytes() {
        hasher.write_u8(b.to_ascii_lowercase());
    }
    hasher.finish()
}

impl LoadBalancingPolicy for Hash {
    fn name(&self) -> &'static str {
        "Hash"
    }

    fn pick(
        &self,
        ctx: &mut RequestContext,
        available: &[Arc<DestinationState>],
    ) -> Option<Arc<DestinationState>> {
        if available.is_empty() {
            return None;
        }
        match self.key(ctx) {
            Some(key) => {
                let index = (hash64(key) % available.len() as u64) as usize;
                available.get(index).cloned()
            }
            None => self.fallback.pick(ctx, available),
        }
    }
}
