//! Least outstanding requests strategy.

use std::sync::Arc;

use crate::cluster::DestinationState;
use crate::load_balancer::{LoadBalancingPolicy, RequestContext};

/// Selects the destination with the fewest outstanding requests.
#[derive(Debug, Default)]
pub struct LeastRequests;

impl LeastRequests {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancingPolicy for LeastRequests {
    fn name(&self) -> &'static str {
        "LeastRequests"
    }

    fn pick(
        &self,
        _ctx: &mut RequestContext,
        available: &[Arc<DestinationState>],
    ) -> Option<Arc<DestinationState>> {
        // In case of tie, the first one is selected (stability)
        available.iter().min_by_key(|d| d.concurrency()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_least_loaded() {
        let lb = LeastRequests::new();
        let b1 = Arc::new(DestinationState::detached("127.0.0.1:8080".parse().unwrap()));
        let b2 = Arc::new(DestinationState::detached("127.0.0.1:8081".parse().unwrap()));
        let backends = vec![b1.clone(), b2.clone()];
        let mut ctx = RequestContext::new(Arc::from("r"));

        // Tie: first wins
        assert_eq!(lb.pick(&mut ctx, &backends).unwrap().endpoint(), b1.endpoint());

        let _g1 = b1.track();
        assert_eq!(lb.pick(&mut ctx, &backends).unwrap().endpoint(), b2.endpoint());

        let _g2 = b2.track();
        let _g3 = b2.track();
        assert_eq!(lb.pick(&mut ctx, &backends).unwrap().endpoint(), b1.endpoint());
    }
}
