//! Uniform random load balancing strategy.

use std::sync::Arc;

use rand::Rng;

use crate::load_balancer::{LbAlgorithm, LbContext, LbEndpoint};

/// Random selector over the healthy endpoints.
#[derive(Debug, Default)]
pub struct Random;

impl Random {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LbAlgorithm for Random {
    fn select(
        &self,
        endpoints: &[Arc<LbEndpoint>],
        _ctx: &LbContext<'_>,
    ) -> Option<Arc<LbEndpoint>> {
        let healthy: Vec<_> = endpoints.iter().filter(|e| e.is_healthy()).collect();
        if healthy.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..healthy.len());
        Some(healthy[idx].clone())
    }
}
