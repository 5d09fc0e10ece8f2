//! Policy name → factory table.
//!
//! Names are matched ignoring ASCII case. Validation consults
//! [`is_known_policy`] so a bad name never reaches [`build_policy`] at runtime.

use std::sync::Arc;
use thiserror::Error;

use crate::config::ClusterConfig;
use crate::load_balancer::affinity::{AffinityError, SessionAffinityPolicy};
use crate::load_balancer::hash::{Hash, HashKey};
use crate::load_balancer::least_requests::LeastRequests;
use crate::load_balancer::power_of_two::PowerOfTwoChoices;
use crate::load_balancer::random::Random;
use crate::load_balancer::round_robin::RoundRobin;
use crate::load_balancer::LoadBalancingPolicy;

pub const RANDOM: &str = "Random";
pub const ROUND_ROBIN: &str = "RoundRobin";
pub const LEAST_REQUESTS: &str = "LeastRequests";
pub const POWER_OF_TWO: &str = "PowerOfTwoChoices";
pub const HASH: &str = "Hash";

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("unknown load balancing policy '{0}'")]
    Unknown(String),

    #[error("cluster '{0}' uses Hash without a key source")]
    MissingHashKey(String),

    #[error(transparent)]
    Affinity(#[from] AffinityError),
}

type Factory = fn(&ClusterConfig) -> Result<Arc<dyn LoadBalancingPolicy>, PolicyError>;

const FACTORIES: &[(&str, Factory)] = &[
    (RANDOM, build_random),
    (ROUND_ROBIN, build_round_robin),
    (LEAST_REQUESTS, build_least_requests),
    (POWER_OF_TWO, build_power_of_two),
    (HASH, build_hash),
];

fn factory(name: &str) -> Option<Factory> {
    FACTORIES
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(name))
        .map(|(_, f)| *f)
}

pub fn is_known_policy(name: &str) -> bool {
    factory(name).is_some()
}

fn build_random(_: &ClusterConfig) -> Result<Arc<dyn LoadBalancingPolicy>, PolicyError> {
    Ok(Arc::new(Random::new()))
}

fn build_round_robin(_: &ClusterConfig) -> Result<Arc<dyn LoadBalancingPolicy>, PolicyError> {
    Ok(Arc::new(RoundRobin::new()))
}

fn build_least_requests(_: &ClusterConfig) -> Result<Arc<dyn LoadBalancingPolicy>, PolicyError> {
    Ok(Arc::new(LeastRequests::new()))
}

fn build_power_of_two(_: &ClusterConfig) -> Result<Arc<dyn LoadBalancingPolicy>, PolicyError> {
    Ok(Arc::new(PowerOfTwoChoices::new()))
}

fn build_hash(config: &ClusterConfig) -> Result<Arc<dyn LoadBalancingPolicy>, PolicyError> {
    let hash = config.hash.as_ref();
    let key = hash
        .and_then(|h| h.header.clone().map(HashKey::Header))
        .or_else(|| hash.and_then(|h| h.cookie.clone().map(HashKey::Cookie)))
        .or_else(|| hash.and_then(|h| h.item.clone().map(HashKey::Item)))
        .ok_or_else(|| PolicyError::MissingHashKey(config.name.clone()))?;
    Ok(Arc::new(Hash::new(key)))
}

/// Build the cluster's policy, wrapped in session affinity when configured.
pub fn build_policy(config: &ClusterConfig) -> Result<Arc<dyn LoadBalancingPolicy>, PolicyError> {
    let factory = factory(&config.load_balancing_policy)
        .ok_or_else(|| PolicyError::Unknown(config.load_balancing_policy.clone()))?;
    let base = factory(config)?;

    match &config.session_affinity {
        Some(affinity) => Ok(Arc::new(SessionAffinityPolicy::new(base, affinity)?)),
        None => Ok(base),
    }
}
