//! Round-robin load balancing.
//!
//! # Algorithm
//! Rotate through healthy endpoints in order.
//!
//! # Design Decisions
//! - Uses an atomic counter, no locks
//! - Skips unhealthy endpoints
//! - Wraps around on overflow

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::load_balancer::{LbAlgorithm, LbContext, LbEndpoint};

/// Round-robin selector.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LbAlgorithm for RoundRobin {
    fn select(
        &self,
        endpoints: &[Arc<LbEndpoint>],
        _ctx: &LbContext<'_>,
    ) -> Option<Arc<LbEndpoint>> {
        if endpoints.is_empty() {
            return None;
        }

        let start = self.counter.fetch_add(1, Ordering::Relaxed);
        for offset in 0..endpoints.len() {
            let candidate = &endpoints[(start + offset) % endpoints.len()];
            if candidate.is_healthy() {
                return Some(candidate.clone());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::context::StateBag;

    fn ctx_parts() -> (crate::http::request::RequestHead, StateBag) {
        let req = http::Request::builder()
            .uri("http://a.example/")
            .body(())
            .unwrap();
        (
            crate::http::request::snapshot_head(&req, None, false),
            StateBag::default(),
        )
    }

    #[test]
    fn rotates_and_skips_unhealthy() {
        let lb = RoundRobin::new();
        let e1 = Arc::new(LbEndpoint::new("http", "127.0.0.1:8080"));
        let e2 = Arc::new(LbEndpoint::new("http", "127.0.0.1:8081"));
        let endpoints = vec![e1.clone(), e2.clone()];
        let (head, state) = ctx_parts();
        let ctx = LbContext {
            head: &head,
            route_id: "r1",
            state: &state,
        };

        let first = lb.select(&endpoints, &ctx).unwrap();
        let second = lb.select(&endpoints, &ctx).unwrap();
        assert_ne!(first.host, second.host);

        e1.set_healthy(false);
        for _ in 0..4 {
            assert_eq!(lb.select(&endpoints, &ctx).unwrap().host, e2.host);
        }

        e2.set_healthy(false);
        assert!(lb.select(&endpoints, &ctx).is_none());
    }
}
