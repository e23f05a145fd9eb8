//! Per-request context carried through the pipeline.
//!
//! One context exists per inbound request, owned exclusively by the task
//! running the pipeline. Filters receive it mutably; nothing in it is
//! shared across tasks. Loopback routes clone it for the inner pipeline
//! run and adopt the inner response afterwards.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use http::{Response, StatusCode};
use tracing::Span;

use crate::http::request::RequestHead;
use crate::observability::logging::AccessLogFilter;
use crate::resilience::BreakerSettings;
use crate::routing::{PathParams, Route};
use crate::security::BackendRatelimit;

/// The side channel between filters and the engine.
///
/// The known key set is closed, so each key is a typed field; filters that
/// need keys of their own use the `extra` sub-map.
#[derive(Default)]
pub struct StateBag {
    /// Full URL override for dynamic backends. Takes precedence over the
    /// host and scheme overrides.
    pub dynamic_backend_url: Option<String>,
    /// Host override for dynamic backends.
    pub dynamic_backend_host: Option<String>,
    /// Scheme override for dynamic backends.
    pub dynamic_backend_scheme: Option<String>,
    /// The outbound target is an HTTP proxy, not the final destination.
    pub backend_is_proxy: bool,
    /// Per-backend rate limit to apply before the backend call.
    pub backend_ratelimit: Option<BackendRatelimit>,
    /// Time budget for the backend call only.
    pub backend_timeout: Option<Duration>,
    /// Cleanup callbacks drained in reverse push order on pipeline exit.
    pub lifo_cleanup: Vec<Box<dyn FnOnce() + Send>>,
    /// Circuit breaker settings for the current route.
    pub breaker_settings: Option<BreakerSettings>,
    /// Operation name recorded on the backend span.
    pub proxy_span_name: Option<String>,
    /// Per-request access log control.
    pub access_log: Option<AccessLogFilter>,
    /// Extra access log fields.
    pub access_log_data: Option<serde_json::Map<String, serde_json::Value>>,
    /// Script name passed to a FastCGI backend.
    pub fastcgi_filename: Option<String>,
    /// Escape hatch for filter-private keys.
    pub extra: HashMap<String, serde_json::Value>,
}

/// State of one request travelling through the pipeline.
pub struct RequestContext {
    /// Request head the filters mutate and the mapper reads.
    pub head: RequestHead,
    /// Inbound body, taken exactly once by the backend dispatch or drain.
    pub body: Option<Body>,
    /// Unmodified head snapshot, kept when the preserve-original flag is on.
    pub original_head: Option<RequestHead>,
    /// Response, none until produced by a backend, filter or shunt.
    pub response: Option<Response<Body>>,
    /// Matched route.
    pub route: Option<std::sync::Arc<Route>>,
    /// Params extracted by the route lookup.
    pub params: PathParams,
    /// Filter ↔ engine side channel.
    pub state: StateBag,
    /// Host header for the outbound request. Empty means "use the resolved
    /// destination host".
    pub outgoing_host: String,
    /// Loopback depth. Zero marks a root context that was not executed yet.
    pub(crate) execution_counter: usize,
    /// When the entry handler started serving.
    pub start_serve: Instant,
    /// Whether the inbound request declared no replayable body.
    pub(crate) no_body: bool,
    shunted: bool,
    deprecated_shunted: bool,
    /// A protocol upgrade took over the connection.
    pub successful_upgrade: bool,
    /// Panic payloads collected in debug mode.
    pub debug_filter_panics: Vec<String>,
    /// Server-side span framing inbound handling.
    pub initial_span: Span,
    /// Client-side span framing the backend call, if one was made.
    pub proxy_span: Option<Span>,
    /// Upgrade token of the inbound connection, if it can upgrade.
    pub(crate) on_upgrade: Option<hyper::upgrade::OnUpgrade>,
    /// Outbound request snapshot taken in debug mode.
    pub(crate) outgoing_debug_request: Option<crate::proxy::debug::DebugRequest>,
    /// Raised when the inbound connection was observed gone (a failed read
    /// on the request body). Shared with the inbound body watcher.
    pub(crate) client_gone: Arc<AtomicBool>,
}

impl RequestContext {
    pub fn new(
        head: RequestHead,
        body: Body,
        preserve_original: bool,
        initial_span: Span,
    ) -> Self {
        let no_body = head.has_no_body();
        let original_head = preserve_original.then(|| head.clone());
        Self {
            head,
            body: Some(body),
            original_head,
            response: None,
            route: None,
            params: PathParams::new(),
            state: StateBag::default(),
            outgoing_host: String::new(),
            execution_counter: 0,
            start_serve: Instant::now(),
            no_body,
            shunted: false,
            deprecated_shunted: false,
            successful_upgrade: false,
            debug_filter_panics: Vec::new(),
            initial_span,
            proxy_span: None,
            on_upgrade: None,
            outgoing_debug_request: None,
            client_gone: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Route failed inbound body reads into the client-gone flag. Called
    /// once by the entry handler before the pipeline runs.
    pub(crate) fn watch_inbound_body(&mut self) {
        if let Some(body) = self.body.take() {
            self.body = Some(crate::http::request::WatchedBody::wrap(
                body,
                self.client_gone.clone(),
            ));
        }
    }

    /// Whether the inbound connection was observed gone.
    pub fn client_gone(&self) -> bool {
        self.client_gone.load(Ordering::Relaxed)
    }

    /// True once the pipeline ran with this context at least once.
    pub(crate) fn was_executed(&self) -> bool {
        self.execution_counter > 0
    }

    /// Loopback depth of the current pipeline run.
    pub fn execution_counter(&self) -> usize {
        self.execution_counter
    }

    /// Attach the matched route and compute the outgoing host.
    pub(crate) fn apply_route(
        &mut self,
        route: std::sync::Arc<Route>,
        params: PathParams,
        preserve_host: bool,
    ) {
        let preserve = route.preserve_host.unwrap_or(preserve_host);
        self.outgoing_host = if preserve {
            self.head.host.clone()
        } else {
            route.backend.host().to_string()
        };
        self.route = Some(route);
        self.params = params;
    }

    /// Short-circuit the pipeline: skip the backend and respond with
    /// whatever the filter chain assembled.
    pub fn shunt(&mut self) {
        self.shunted = true;
    }

    pub fn shunted(&self) -> bool {
        self.shunted
    }

    /// Legacy short-circuit signal kept for old filters.
    pub fn mark_served(&mut self) {
        tracing::warn!("filter used the deprecated served signal, use shunt instead");
        self.deprecated_shunted = true;
    }

    pub(crate) fn deprecated_shunted(&self) -> bool {
        self.deprecated_shunted
    }

    /// Push a cleanup callback, run in reverse push order on pipeline exit.
    pub fn defer_cleanup(&mut self, f: impl FnOnce() + Send + 'static) {
        self.state.lifo_cleanup.push(Box::new(f));
    }

    /// Install a response, preserving nothing unless configured to.
    pub fn set_response(&mut self, response: Response<Body>, _preserve_original: bool) {
        self.response = Some(response);
    }

    /// Guarantee a response exists on shunt paths.
    pub(crate) fn ensure_default_response(&mut self) {
        if self.response.is_none() {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::NOT_FOUND;
            self.response = Some(response);
        }
    }

    /// Drop the backend span, finishing it. Used before a retry so the
    /// second attempt gets a fresh span.
    pub(crate) fn finish_proxy_span(&mut self) {
        self.proxy_span = None;
    }

    /// Clone for a loopback run. The body, the state bag and the upgrade
    /// token move into the clone; the route is shared. The caller adopts
    /// the response, span and state bag back afterwards.
    pub(crate) fn clone_for_loopback(&mut self) -> RequestContext {
        RequestContext {
            head: self.head.clone(),
            body: self.body.take(),
            original_head: self.original_head.clone(),
            response: None,
            route: self.route.clone(),
            params: self.params.clone(),
            state: std::mem::take(&mut self.state),
            outgoing_host: self.outgoing_host.clone(),
            execution_counter: self.execution_counter,
            start_serve: self.start_serve,
            no_body: self.no_body,
            shunted: false,
            deprecated_shunted: false,
            successful_upgrade: false,
            debug_filter_panics: Vec::new(),
            initial_span: self.initial_span.clone(),
            proxy_span: None,
            on_upgrade: self.on_upgrade.take(),
            outgoing_debug_request: None,
            // The flag tracks the one inbound connection, so loopback
            // clones share it.
            client_gone: self.client_gone.clone(),
        }
    }

    /// Adopt the outcome of a finished loopback run.
    pub(crate) fn adopt_loopback(&mut self, mut inner: RequestContext) {
        self.response = inner.response.take();
        self.proxy_span = inner.proxy_span.take();
        self.state = std::mem::take(&mut inner.state);
        self.debug_filter_panics.append(&mut inner.debug_filter_panics);
        self.successful_upgrade |= inner.successful_upgrade;
    }

    /// Peer address of the inbound connection.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.head.remote_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext {
        let req = http::Request::builder()
            .uri("http://a.example/x")
            .body(())
            .unwrap();
        let head = crate::http::request::snapshot_head(&req, None, false);
        RequestContext::new(head, Body::empty(), false, Span::none())
    }

    #[test]
    fn default_response_is_404() {
        let mut ctx = ctx();
        ctx.ensure_default_response();
        assert_eq!(ctx.response.as_ref().unwrap().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn loopback_clone_moves_body_and_state() {
        let mut outer = ctx();
        outer.state.dynamic_backend_host = Some("b.internal".into());

        let mut inner = outer.clone_for_loopback();
        assert!(outer.body.is_none());
        assert!(inner.body.is_some());
        assert_eq!(
            inner.state.dynamic_backend_host.as_deref(),
            Some("b.internal")
        );

        inner.response = Some(Response::new(Body::empty()));
        outer.adopt_loopback(inner);
        assert!(outer.response.is_some());
        assert_eq!(
            outer.state.dynamic_backend_host.as_deref(),
            Some("b.internal")
        );
    }

    #[test]
    fn preserve_original_keeps_untouched_head() {
        let req = http::Request::builder()
            .uri("http://a.example/x")
            .body(())
            .unwrap();
        let head = crate::http::request::snapshot_head(&req, None, false);
        let mut ctx = RequestContext::new(head, Body::empty(), true, Span::none());

        ctx.head
            .headers
            .insert("x-added", "yes".parse().unwrap());
        let original = ctx.original_head.as_ref().unwrap();
        assert!(!original.headers.contains_key("x-added"));
    }
}
