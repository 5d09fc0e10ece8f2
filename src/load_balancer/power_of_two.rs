//! Power-of-two-choices strategy.

use std::sync::Arc;

use crate::cluster::DestinationState;
use crate::load_balancer::{LoadBalancingPolicy, RequestContext};

/// Samples two distinct destinations and keeps the less loaded one.
#[derive(Debug, Default)]
pub struct PowerOfTwoChoices;

impl PowerOfTwoChoices {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancingPolicy for PowerOfTwoChoices {
    fn name(&self) -> &'static str {
        "PowerOfTwoChoices"
    }

    fn pick(
        &self,
        _ctx: &mut RequestContext,
        available: &[Arc<DestinationState>],
    ) -> Option<Arc<DestinationState>> {
        match available.len() {
            0 => None,
            1 => Some(available[0].clone()),
            len => {
                let first = fastrand::usize(..len);
                let mut second = fastrand::usize(..len - 1);
                if second >= first {
                    second += 1;
                }
                let (a, b) = (&available[first], &available[second]);
                if b.concurrency() < a.concurrency() {
                    Some(b.clone())
                } else {
                    Some(a.clone())
                }
            }
        }
    }
}
