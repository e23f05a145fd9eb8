//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Route matched → LoadBalanced backend identified
//!     → Apply the route's algorithm:
//!         - round_robin.rs (rotate through endpoints)
//!         - least_inflight.rs (pick endpoint with fewest requests in flight)
//!         - random.rs (uniform choice)
//!     → endpoint.rs (track the in-flight request with a guard)
//!     → Return selected endpoint or none when all are unhealthy
//! ```
//!
//! # Design Decisions
//! - Algorithms are stateless apart from atomics; endpoints track inflight
//! - Unhealthy endpoints excluded from selection
//! - The guard decrements the inflight counter on drop

pub mod endpoint;
pub mod least_inflight;
pub mod random;
pub mod round_robin;

use std::sync::Arc;

use crate::http::request::RequestHead;
use crate::proxy::context::StateBag;

pub use endpoint::{InflightGuard, LbEndpoint};
pub use least_inflight::LeastInflight;
pub use random::Random;
pub use round_robin::RoundRobin;

/// Inputs available to an algorithm when selecting an endpoint.
pub struct LbContext<'a> {
    pub head: &'a RequestHead,
    pub route_id: &'a str,
    pub state: &'a StateBag,
}

/// Endpoint selection strategy attached to a load-balanced route.
pub trait LbAlgorithm: Send + Sync {
    /// Select one healthy endpoint, or none when all are down.
    fn select(&self, endpoints: &[Arc<LbEndpoint>], ctx: &LbContext<'_>) -> Option<Arc<LbEndpoint>>;
}

/// Algorithm from its configured name.
pub fn algorithm_by_name(name: &str) -> Option<Arc<dyn LbAlgorithm>> {
    match name {
        "roundRobin" => Some(Arc::new(RoundRobin::new())),
        "random" => Some(Arc::new(Random::new())),
        "leastInflight" => Some(Arc::new(LeastInflight::new())),
        _ => None,
    }
}
