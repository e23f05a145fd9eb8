//! The request pipeline core.
//!
//! # Data Flow
//! ```text
//! http/server.rs entry handler
//!     → engine.rs (loop guard, rate limit, route lookup)
//!     → filters.rs (request phase)
//!     → {shunt | loopback | debug | mapper.rs → transport.rs}
//!     → filters.rs (response phase, reversed)
//!     → http/response.rs (streaming back to the client)
//! Errors at any stage divert to error.rs.
//! ```
//!
//! # Design Decisions
//! - One context per request, owned by one task; no shared mutability
//! - External collaborators (routing, filters, registries, FastCGI,
//!   upgrade bridging) are consumed through traits
//! - Loopback re-enters the engine with a cloned context

pub mod context;
pub mod debug;
mod engine;
pub mod error;
mod filters;
pub mod mapper;
pub mod transport;
pub mod upgrade;

use std::sync::Arc;

use http::StatusCode;

use crate::lifecycle::Shutdown;
use crate::observability::TraceConfig;
use crate::resilience::BreakerRegistry;
use crate::routing::{PriorityRoute, RouteLookup, RouteTable};
use crate::security::RatelimitRegistry;

pub use context::{RequestContext, StateBag};
pub use error::ProxyError;
pub use transport::{
    BackendTransport, OutboundRequest, PooledTransport, TransportOptions,
    DEFAULT_CLOSE_IDLE_CONNS_PERIOD, DEFAULT_IDLE_CONNS_PER_HOST,
};
pub use upgrade::UpgradeHandler;

/// Number of loops allowed by default.
pub const DEFAULT_MAX_LOOPBACKS: usize = 9;

/// Route id used in logs and metrics when no route matched.
pub(crate) const UNKNOWN_ROUTE_ID: &str = "_unknownroute_";

/// Control flags of a proxy instance. Immutable after construction.
#[derive(Debug, Clone, Copy, Default)]
pub struct Flags {
    /// Skip verification of backend TLS certificates.
    pub insecure: bool,
    /// Filters receive an unmodified snapshot of the original request.
    pub preserve_original: bool,
    /// Outbound requests default to the inbound Host header instead of the
    /// backend address.
    pub preserve_host: bool,
    /// Run as a debug proxy: execute filters, never call the backend, and
    /// respond with a document describing what the filters did.
    pub debug: bool,
    /// Remove hop-by-hop headers on the outbound request.
    pub hop_headers_removal: bool,
    /// Normalize reserved characters escaped in the request path.
    pub patch_path: bool,
}

impl Flags {
    /// Debug mode implies preserving the original request metadata.
    pub fn preserve_original(&self) -> bool {
        self.preserve_original || self.debug
    }
}

/// Proxy initialization parameters.
pub struct Params {
    /// Route lookup matching incoming requests to routes.
    pub route_lookup: Arc<dyn RouteLookup>,
    /// Custom routes matched before the general lookup.
    pub priority_routes: Vec<Arc<dyn PriorityRoute>>,
    /// Control flags.
    pub flags: Flags,
    /// Enable the experimental protocol upgrade feature.
    pub experimental_upgrade: bool,
    /// When set, no access log is printed unless a filter asks for it.
    pub access_log_disabled: bool,
    /// Status used when no route is found. Out-of-range values fall back
    /// to 404.
    pub default_http_status: Option<u16>,
    /// Maximum number of allowed loops. `None` applies the default (9),
    /// negative values disable looping.
    pub max_loopbacks: Option<i32>,
    /// Circuit breaker registry. `None` disables breakers.
    pub breakers: Option<Arc<BreakerRegistry>>,
    /// Rate limiter registry. `None` disables rate limits.
    pub limiters: Option<Arc<RatelimitRegistry>>,
    /// Backend connection behaviour.
    pub transport: TransportOptions,
    /// Replacement for the pooled backend transport (testing, decoration).
    pub custom_transport: Option<Arc<dyn BackendTransport>>,
    /// Transport consulted for `fastcgi` scheme backends.
    pub fastcgi_transport: Option<Arc<dyn BackendTransport>>,
    /// Helper bridging protocol upgrades to the backend.
    pub upgrade_handler: Option<Arc<dyn UpgradeHandler>>,
    /// Tracing behaviour.
    pub tracing: TraceConfig,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            route_lookup: Arc::new(RouteTable::new()),
            priority_routes: Vec::new(),
            flags: Flags::default(),
            experimental_upgrade: false,
            access_log_disabled: false,
            default_http_status: None,
            max_loopbacks: None,
            breakers: None,
            limiters: None,
            transport: TransportOptions::default(),
            custom_transport: None,
            fastcgi_transport: None,
            upgrade_handler: None,
            tracing: TraceConfig::default(),
        }
    }
}

/// The proxy: one instance serves all inbound requests.
pub struct Proxy {
    pub(crate) flags: Flags,
    pub(crate) route_lookup: Arc<dyn RouteLookup>,
    pub(crate) priority_routes: Vec<Arc<dyn PriorityRoute>>,
    pub(crate) transport: Arc<dyn BackendTransport>,
    pub(crate) fastcgi_transport: Option<Arc<dyn BackendTransport>>,
    pub(crate) upgrade_handler: Option<Arc<dyn UpgradeHandler>>,
    pub(crate) experimental_upgrade: bool,
    pub(crate) max_loops: usize,
    pub(crate) default_status: StatusCode,
    pub(crate) breakers: Option<Arc<BreakerRegistry>>,
    pub(crate) limiters: Option<Arc<RatelimitRegistry>>,
    pub(crate) access_log_disabled: bool,
    pub(crate) trace_config: TraceConfig,
    pub(crate) hostname: String,
    shutdown: Shutdown,
}

impl Proxy {
    /// Create a proxy from its parameters.
    ///
    /// When called inside a Tokio runtime, the idle connection eviction
    /// task starts immediately; it stops when `close` is called.
    pub fn with_params(params: Params) -> Arc<Self> {
        let shutdown = Shutdown::new();

        let transport: Arc<dyn BackendTransport> = match params.custom_transport {
            Some(custom) => custom,
            None => {
                let pooled = Arc::new(PooledTransport::new(params.transport.clone()));
                if tokio::runtime::Handle::try_current().is_ok() {
                    pooled.spawn_idle_eviction(&shutdown);
                }
                pooled
            }
        };

        let max_loops = match params.max_loopbacks {
            None => DEFAULT_MAX_LOOPBACKS,
            Some(n) if n < 0 => 0,
            Some(0) => DEFAULT_MAX_LOOPBACKS,
            Some(n) => n as usize,
        };

        let default_status = params
            .default_http_status
            .and_then(|code| StatusCode::from_u16(code).ok())
            .unwrap_or(StatusCode::NOT_FOUND);

        let hostname = std::env::var("HOSTNAME").unwrap_or_default();

        Arc::new(Self {
            flags: params.flags,
            route_lookup: params.route_lookup,
            priority_routes: params.priority_routes,
            transport,
            fastcgi_transport: params.fastcgi_transport,
            upgrade_handler: params.upgrade_handler,
            experimental_upgrade: params.experimental_upgrade,
            max_loops,
            default_status,
            breakers: params.breakers,
            limiters: params.limiters,
            access_log_disabled: params.access_log_disabled,
            trace_config: params.tracing,
            hostname,
            shutdown,
        })
    }

    /// Stop background work owned by the proxy (idle connection eviction).
    pub fn close(&self) {
        self.shutdown.trigger();
    }

    /// Loop budget of this instance.
    pub fn max_loops(&self) -> usize {
        self.max_loops
    }
}
