//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request head (host, path, method)
//!     → priority routes (checked first, in order)
//!     → table.rs (priority-sorted host/prefix lookup)
//!     → Return: matched Route + path params, or NoMatch
//! ```
//!
//! # Design Decisions
//! - Routes are compiled once and immutable; lookups share `Arc<Route>`
//! - The lookup itself is pluggable: the engine only consumes `RouteLookup`
//! - First match wins (ordered by priority)

pub mod table;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::http::request::RequestHead;
use crate::load_balancer::{LbAlgorithm, LbEndpoint};
use crate::proxy::context::RequestContext;

pub use table::RouteTable;

/// Parameters extracted from the matched path.
pub type PathParams = HashMap<String, String>;

/// What the route forwards to.
pub enum BackendKind {
    /// Fixed scheme and host.
    Static { scheme: String, host: String },
    /// Scheme and host taken from the inbound request, overridable by
    /// filters through the state bag.
    Dynamic,
    /// One endpoint chosen per request by the route's algorithm.
    LoadBalanced {
        algorithm: Arc<dyn LbAlgorithm>,
        endpoints: Vec<Arc<LbEndpoint>>,
    },
    /// Skip the backend; the filter chain assembles the response.
    Shunt,
    /// Re-enter the proxy pipeline with the same request.
    Loopback,
}

impl BackendKind {
    /// Short label used in logs and error responses.
    pub fn label(&self) -> &'static str {
        match self {
            BackendKind::Static { .. } => "network",
            BackendKind::Dynamic => "dynamic",
            BackendKind::LoadBalanced { .. } => "lb",
            BackendKind::Shunt => "shunt",
            BackendKind::Loopback => "loopback",
        }
    }

    /// Host of a static backend, empty otherwise.
    pub fn host(&self) -> &str {
        match self {
            BackendKind::Static { host, .. } => host,
            _ => "",
        }
    }
}

impl fmt::Debug for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Static { scheme, host } => write!(f, "Static({scheme}://{host})"),
            BackendKind::Dynamic => write!(f, "Dynamic"),
            BackendKind::LoadBalanced { endpoints, .. } => {
                write!(f, "LoadBalanced({} endpoints)", endpoints.len())
            }
            BackendKind::Shunt => write!(f, "Shunt"),
            BackendKind::Loopback => write!(f, "Loopback"),
        }
    }
}

/// A filter attached to a route.
///
/// Both hooks receive the request context and may mutate the request head,
/// the response and the state bag, and may signal a shunt. Implementations
/// are supplied by the routing owner; the engine only invokes them.
pub trait Filter: Send + Sync {
    /// Name used in logs and per-filter metrics.
    fn name(&self) -> &str;

    /// Called in declared order while the request travels towards the backend.
    fn request(&self, _ctx: &mut RequestContext) {}

    /// Called in reverse order while the response travels back to the client.
    fn response(&self, _ctx: &mut RequestContext) {}
}

/// A single route as consumed by the pipeline engine.
pub struct Route {
    /// Identifier used in logs and metrics.
    pub id: String,
    /// Backend to dispatch to.
    pub backend: BackendKind,
    /// Ordered filter chain.
    pub filters: Vec<Arc<dyn Filter>>,
    /// Per-route override of the global host preservation flag.
    pub preserve_host: Option<bool>,
}

impl Route {
    pub fn new(id: impl Into<String>, backend: BackendKind) -> Self {
        Self {
            id: id.into(),
            backend,
            filters: Vec::new(),
            preserve_host: None,
        }
    }

    pub fn with_filters(mut self, filters: Vec<Arc<dyn Filter>>) -> Self {
        self.filters = filters;
        self
    }
}

/// Route lookup as consumed by the engine. Implementations return an
/// immutable snapshot valid for the lifetime of the request.
pub trait RouteLookup: Send + Sync {
    fn lookup(&self, head: &RequestHead) -> Option<(Arc<Route>, PathParams)>;
}

/// Custom route matched against each request before the lookup table.
pub trait PriorityRoute: Send + Sync {
    fn matches(&self, head: &RequestHead) -> Option<(Arc<Route>, PathParams)>;
}
