//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request to backend:
//!     → circuit_breaker.rs (fail fast while the backend is assumed down)
//!     → backend call
//!     → outcome reported back to the breaker
//! ```
//!
//! # Design Decisions
//! - Per route-settings breaker (keyed by host), not global
//! - Fail fast in Open state (no waiting for timeout)
//! - Single probe in Half-Open (prevents hammering a recovering backend)

pub mod circuit_breaker;

pub use circuit_breaker::{BreakerDone, BreakerRegistry, BreakerSettings, CircuitBreaker};
