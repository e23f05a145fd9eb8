//! Least-inflight load balancing strategy.

use std::sync::Arc;

use crate::load_balancer::{LbAlgorithm, LbContext, LbEndpoint};

/// Least-inflight selector.
/// Selects the healthy endpoint with the minimum number of requests in flight.
#[derive(Debug, Default)]
pub struct LeastInflight;

impl LeastInflight {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LbAlgorithm for LeastInflight {
    fn select(
        &self,
        endpoints: &[Arc<LbEndpoint>],
        _ctx: &LbContext<'_>,
    ) -> Option<Arc<LbEndpoint>> {
        // In case of a tie, the first one is selected (stability).
        endpoints
            .iter()
            .filter(|e| e.is_healthy())
            .min_by_key(|e| e.inflight_count())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::context::StateBag;

    #[test]
    fn picks_endpoint_with_fewest_inflight() {
        let lb = LeastInflight::new();
        let e1 = Arc::new(LbEndpoint::new("http", "127.0.0.1:8080"));
        let e2 = Arc::new(LbEndpoint::new("http", "127.0.0.1:8081"));

        // artificially load e1
        let _g = e1.track_inflight();

        let endpoints = vec![e1.clone(), e2.clone()];
        let req = http::Request::builder()
            .uri("http://a.example/")
            .body(())
            .unwrap();
        let head = crate::http::request::snapshot_head(&req, None, false);
        let state = StateBag::default();
        let ctx = LbContext {
            head: &head,
            route_id: "r1",
            state: &state,
        };

        assert_eq!(lb.select(&endpoints, &ctx).unwrap().host, e2.host);

        let _g2 = e2.track_inflight();
        let _g3 = e2.track_inflight();
        assert_eq!(lb.select(&endpoints, &ctx).unwrap().host, e1.host);
    }
}
