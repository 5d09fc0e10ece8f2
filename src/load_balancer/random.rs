//! Uniform random selection.

use std::sync::Arc;

use crate::cluster::DestinationState;
use crate::load_balancer::{LoadBalancingPolicy, RequestContext};

#[derive(Debug, Default)]
pub struct Random;

impl Random {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancingPolicy for Random {
    fn name(&self) -> &'static str {
        "Random"
    }

    fn pick(
        &self,
        _ctx: &mut RequestContext,
        available: &[Arc<DestinationState>],
    ) -> Option<Arc<DestinationState>> {
        if available.is_empty() {
            return None;
        }
        available.get(fastrand::usize(..available.len())).cloned()
    }
}
