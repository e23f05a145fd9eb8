//! Programmable HTTP reverse proxy core.
//!
//! For each inbound request the pipeline selects a route, runs an ordered
//! chain of request filters, dispatches to a backend (static, dynamic,
//! load-balanced, looped or shunted), runs the same filters in reverse on
//! the response, and streams it back with tracing, metrics, circuit
//! breaking and rate limiting applied.

// Core subsystems
pub mod config;
pub mod http;
pub mod proxy;
pub mod routing;

// Traffic management
pub mod load_balancer;
pub mod resilience;
pub mod security;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use crate::http::server::{router, run};
pub use proxy::{Flags, Params, Proxy, ProxyError, RequestContext, StateBag};
pub use routing::{BackendKind, Filter, PriorityRoute, Route, RouteLookup, RouteTable};
