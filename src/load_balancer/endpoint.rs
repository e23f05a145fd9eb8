//! Load-balanced endpoint abstraction.
//!
//! # Responsibilities
//! - Represent a single backend endpoint of a load-balanced route
//! - Track requests in flight (for least-inflight selection)
//! - Carry the health signal consumed by the algorithms

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// A single endpoint of a load-balanced backend.
#[derive(Debug)]
pub struct LbEndpoint {
    /// Scheme to reach the endpoint with.
    pub scheme: String,
    /// Host (and port) of the endpoint.
    pub host: String,
    /// Number of requests currently in flight.
    pub inflight: AtomicUsize,
    /// Health signal, updated by an external health tracker.
    pub healthy: AtomicBool,
}

impl LbEndpoint {
    /// Create a new, healthy endpoint.
    pub fn new(scheme: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            inflight: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
        }
    }

    /// Current number of requests in flight.
    pub fn inflight_count(&self) -> usize {
        self.inflight.load(Ordering::Relaxed)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    /// Track one request in flight. The guard decrements on drop.
    pub fn track_inflight(self: &Arc<Self>) -> InflightGuard {
        self.inflight.fetch_add(1, Ordering::Relaxed);
        InflightGuard {
            endpoint: self.clone(),
        }
    }
}

/// RAII guard accounting for one in-flight request on an endpoint.
#[derive(Debug)]
pub struct InflightGuard {
    endpoint: Arc<LbEndpoint>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.endpoint.inflight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_tracks_inflight() {
        let e = Arc::new(LbEndpoint::new("http", "127.0.0.1:8080"));
        assert_eq!(e.inflight_count(), 0);
        {
            let _g1 = e.track_inflight();
            let _g2 = e.track_inflight();
            assert_eq!(e.inflight_count(), 2);
        }
        assert_eq!(e.inflight_count(), 0);
    }
}
