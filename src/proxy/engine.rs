//! The per-request pipeline.
//!
//! `execute` is the control loop: loop guard, global rate limit, route
//! lookup, request filters, backend dispatch by kind, retry, response
//! filters. Loopback routes re-enter `execute` recursively with a cloned
//! context.

use std::time::{Duration, Instant};

use axum::body::Body;
use futures_util::future::BoxFuture;
use http::header::CONTENT_LENGTH;
use http::{HeaderValue, Response, StatusCode};
use tokio::time::timeout;

use crate::http::request::drain_body;
use crate::http::response::add_branding;
use crate::observability::metrics;
use crate::observability::tracing::inject_trace_headers;
use crate::proxy::context::RequestContext;
use crate::proxy::debug::DebugRequest;
use crate::proxy::error::ProxyError;
use crate::proxy::mapper;
use crate::proxy::upgrade::{is_upgrade_request, upgrade_protocol};
use crate::proxy::Proxy;
use crate::resilience::BreakerDone;
use crate::routing::BackendKind;

impl Proxy {
    /// Run the pipeline for one (possibly looped) request.
    pub(crate) fn execute<'a>(
        &'a self,
        ctx: &'a mut RequestContext,
    ) -> BoxFuture<'a, Result<(), ProxyError>> {
        Box::pin(async move {
            if ctx.execution_counter() > self.max_loops {
                return Err(ProxyError::max_loopbacks());
            }

            let result = self.execute_inner(ctx).await;

            // Cleanup pushed by filters runs on every exit path, in
            // reverse push order.
            let cleanup = std::mem::take(&mut ctx.state.lifo_cleanup);
            for done in cleanup.into_iter().rev() {
                done();
            }

            result
        })
    }

    async fn execute_inner(&self, ctx: &mut RequestContext) -> Result<(), ProxyError> {
        // The global rate limit applies once per root request, never to
        // loopback re-entries.
        if !ctx.was_executed() {
            if let Some(limiters) = &self.limiters {
                let client = ctx.head.remote_host();
                if let Some(exceeded) = limiters.check_global(&client) {
                    return Err(ProxyError::ratelimited(exceeded));
                }
            }
        }
        ctx.execution_counter += 1;

        let lookup_start = Instant::now();
        let matched = self.lookup_route(ctx);
        metrics::measure_route_lookup(lookup_start);
        let (route, params) = match matched {
            Some(found) => found,
            None => {
                if !self.flags.debug {
                    metrics::incr_routing_failures();
                }
                tracing::debug!(uri = %ctx.head.uri, "could not find a route");
                return Err(ProxyError::route_lookup_failed());
            }
        };
        ctx.apply_route(route.clone(), params, self.flags.preserve_host);

        let processed = self.apply_filters_to_request(ctx);

        if ctx.deprecated_shunted() {
            tracing::debug!(route = %route.id, "deprecated shunting detected in route");
            return Err(ProxyError::handled());
        } else if ctx.shunted() || matches!(route.backend, BackendKind::Shunt) {
            // Consume the body to release the inbound connection.
            if let Some(body) = ctx.body.take() {
                drain_body(body).await;
            }
            ctx.ensure_default_response();
        } else if matches!(route.backend, BackendKind::Loopback) {
            let mut loop_ctx = ctx.clone_for_loopback();
            let result = self.execute(&mut loop_ctx).await;
            ctx.adopt_loopback(loop_ctx);
            result?;
        } else if self.flags.debug {
            let mapped = mapper::map_request(ctx, &self.flags)?;
            ctx.outgoing_debug_request =
                Some(DebugRequest::from_request(&mapped.outbound.request));
            ctx.set_response(Response::new(Body::empty()), self.flags.preserve_original());
        } else {
            self.dispatch_backend(ctx, &route.id).await?;
            if ctx.successful_upgrade {
                // The upgrade helper owns the connection from here on.
                return Ok(());
            }
        }

        if let Some(response) = &mut ctx.response {
            add_branding(response.headers_mut());
        }
        self.apply_filters_to_response(ctx, processed);
        Ok(())
    }

    /// The normal backend branch: breaker gate, timeout budget, backend
    /// call with the single-retry policy, backend metrics.
    async fn dispatch_backend(
        &self,
        ctx: &mut RequestContext,
        route_id: &str,
    ) -> Result<(), ProxyError> {
        let (done, allow) = self.check_breaker(ctx);
        if !allow {
            tracing::debug!(route = %route_id, circuit_breaker = "open");
            // Consume the body to prevent connection leaks.
            if let Some(body) = ctx.body.take() {
                drain_body(body).await;
            }
            return Err(ProxyError::circuit_open());
        }

        let budget = ctx.state.backend_timeout;
        let backend_start = Instant::now();
        let response = match self.make_backend_request(ctx, budget).await {
            Ok(response) => response,
            Err(perr) => {
                if let Some(done) = &done {
                    done.done(false);
                }
                metrics::incr_errors_backend(route_id);

                if !retryable(ctx, &perr) {
                    return Err(perr);
                }

                // A fresh span for the second attempt.
                ctx.finish_proxy_span();
                tracing::debug!(route = %route_id, event = "retry");
                match self.make_backend_request(ctx, budget).await {
                    Ok(response) => response,
                    Err(perr2) => {
                        tracing::error!(error = %perr2, "failed to retry backend request");
                        if perr2.status(self.default_status).as_u16()
                            >= StatusCode::INTERNAL_SERVER_ERROR.as_u16()
                        {
                            metrics::measure_backend_5xx(backend_start);
                        }
                        return Err(perr2);
                    }
                }
            }
        };

        if ctx.successful_upgrade {
            ctx.set_response(response, self.flags.preserve_original());
            return Ok(());
        }

        let status = response.status().as_u16();
        if status >= 500 {
            metrics::measure_backend_5xx(backend_start);
        }
        if let Some(done) = &done {
            done.done(status < 500);
        }

        let backend_host = ctx
            .route
            .as_ref()
            .map(|r| r.backend.host().to_string())
            .unwrap_or_default();
        ctx.set_response(response, self.flags.preserve_original());
        metrics::measure_backend(route_id, backend_start);
        metrics::measure_backend_host(&backend_host, backend_start);
        Ok(())
    }

    /// Map, gate, trace and send one backend attempt.
    async fn make_backend_request(
        &self,
        ctx: &mut RequestContext,
        budget: Option<Duration>,
    ) -> Result<Response<Body>, ProxyError> {
        let mapped = mapper::map_request(ctx, &self.flags)?;

        // Per-backend rate limit: reject without a backend call.
        if let Some(limit) = ctx.state.backend_ratelimit.clone() {
            if let Some(limiters) = &self.limiters {
                let uri = mapped.outbound.request.uri();
                let key = format!(
                    "{}://{}",
                    uri.scheme_str().unwrap_or("http"),
                    uri.authority().map(|a| a.as_str()).unwrap_or_default()
                );
                if !limiters.allow_backend(limit.settings, &key) {
                    let mut response = Response::new(Body::empty());
                    *response.status_mut() = limit.status_code;
                    response
                        .headers_mut()
                        .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
                    return Ok(response);
                }
            }
        }

        let _inflight = mapped.endpoint.as_ref().map(|e| e.track_inflight());
        let mut outbound = mapped.outbound;

        if self.experimental_upgrade && is_upgrade_request(&outbound.request) {
            let handler = self.upgrade_handler.as_ref().ok_or_else(|| {
                ProxyError::with_code(
                    StatusCode::BAD_GATEWAY,
                    io_err("no upgrade handler configured"),
                )
            })?;
            let on_upgrade = ctx.on_upgrade.take().ok_or_else(|| {
                ProxyError::with_code(
                    StatusCode::BAD_GATEWAY,
                    io_err("inbound connection cannot upgrade"),
                )
            })?;
            tracing::debug!(
                protocol = %upgrade_protocol(&outbound.request),
                "delegating protocol upgrade"
            );
            let response = handler.serve(outbound, on_upgrade).await?;
            ctx.successful_upgrade = true;
            return Ok(response);
        }

        let route_id = ctx
            .route
            .as_ref()
            .map(|r| r.id.clone())
            .unwrap_or_default();
        let url_without_query = {
            let uri = outbound.request.uri();
            format!(
                "{}://{}{}",
                uri.scheme_str().unwrap_or("http"),
                uri.authority().map(|a| a.as_str()).unwrap_or_default(),
                uri.path()
            )
        };
        let backend_authority = outbound
            .request
            .uri()
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let operation = ctx
            .state
            .proxy_span_name
            .clone()
            .unwrap_or_else(|| "proxy".to_string());

        let span = tracing::info_span!(
            "proxy",
            operation = %operation,
            otel.kind = "client",
            component = "waygate",
            route_id = %route_id,
            http.url = %url_without_query,
            http.method = %outbound.request.method(),
            http.host = %backend_authority,
            http.status_code = tracing::field::Empty,
            error = tracing::field::Empty,
        );

        inject_trace_headers(&ctx.head.headers, outbound.request.headers_mut());
        metrics::incr_outgoing(outbound.request.version());

        let transport = if outbound.request.uri().scheme_str() == Some("fastcgi") {
            // FastCGI expects the Host in host:port form; the backend
            // process receives it as two separate params.
            let port = outbound.request.uri().port_u16().unwrap_or(9000);
            let host = outbound
                .request
                .uri()
                .host()
                .unwrap_or_default()
                .to_string();
            let host_port = format!("{host}:{port}");
            outbound
                .request
                .headers_mut()
                .insert(http::header::HOST, HeaderValue::from_str(&host_port)
                    .map_err(ProxyError::map)?);
            self.fastcgi_transport.as_ref().ok_or_else(|| {
                ProxyError::with_code(
                    StatusCode::BAD_GATEWAY,
                    io_err("no fastcgi transport configured"),
                )
            })?
        } else {
            &self.transport
        };

        tracing::debug!(parent: &span, http_roundtrip = "start");
        let round_trip = transport.round_trip(outbound);
        let result = match budget {
            Some(t) => match timeout(t, round_trip).await {
                Err(_) => Err(ProxyError::with_code(
                    StatusCode::GATEWAY_TIMEOUT,
                    io_err("backend timeout exceeded"),
                )),
                Ok(result) => result,
            },
            None => round_trip.await,
        };
        tracing::debug!(parent: &span, http_roundtrip = "end");

        match result {
            Ok(response) => {
                span.record("http.status_code", response.status().as_u16());
                ctx.proxy_span = Some(span);
                Ok(response)
            }
            Err(perr) => {
                span.record("error", true);
                ctx.proxy_span = Some(span);
                Err(perr.wrap_backend(&backend_authority))
            }
        }
    }

    fn lookup_route(
        &self,
        ctx: &RequestContext,
    ) -> Option<(std::sync::Arc<crate::routing::Route>, crate::routing::PathParams)> {
        for priority in &self.priority_routes {
            if let Some(found) = priority.matches(&ctx.head) {
                return Some(found);
            }
        }
        self.route_lookup.lookup(&ctx.head)
    }

    fn check_breaker(&self, ctx: &RequestContext) -> (Option<BreakerDone>, bool) {
        let Some(registry) = &self.breakers else {
            return (None, true);
        };
        let mut settings = ctx.state.breaker_settings.clone().unwrap_or_default();
        // The breaker is always keyed by the outgoing host; filters only
        // supply thresholds.
        settings.host = ctx.outgoing_host.clone();
        let Some(breaker) = registry.get(settings) else {
            return (None, true);
        };
        match breaker.allow() {
            Some(done) => (Some(done), true),
            None => (None, false),
        }
    }
}

/// A failed backend attempt is retried exactly once iff the failure came
/// before HTTP data was sent, a different endpoint can be selected, and
/// there is no body that would have to be replayed.
fn retryable(ctx: &RequestContext, perr: &ProxyError) -> bool {
    perr.code().map(|c| c.as_u16()) != Some(499)
        && perr.dialing_failed()
        && matches!(
            ctx.route.as_ref().map(|r| &r.backend),
            Some(BackendKind::LoadBalanced { .. })
        )
        && ctx.no_body
}

fn io_err(msg: &'static str) -> std::io::Error {
    std::io::Error::other(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tracing::Span;

    use crate::load_balancer::{LbEndpoint, RoundRobin};
    use crate::proxy::Params;
    use crate::resilience::{BreakerRegistry, BreakerSettings};
    use crate::routing::Route;

    fn ctx_with_route(backend: BackendKind, no_body: bool) -> RequestContext {
        let mut builder = http::Request::builder().uri("http://a.example/x");
        if !no_body {
            builder = builder.header("content-length", "5");
        }
        let req = builder.body(()).unwrap();
        let head = crate::http::request::snapshot_head(&req, None, false);
        let mut ctx = RequestContext::new(head, Body::empty(), false, Span::none());
        ctx.apply_route(Arc::new(Route::new("r1", backend)), Default::default(), false);
        ctx
    }

    fn lb_backend() -> BackendKind {
        BackendKind::LoadBalanced {
            algorithm: Arc::new(RoundRobin::new()),
            endpoints: vec![Arc::new(LbEndpoint::new("http", "127.0.0.1:1"))],
        }
    }

    #[test]
    fn retry_needs_dial_failure_lb_and_empty_body() {
        let dial = ProxyError::dial(std::io::Error::other("refused"));

        let ctx = ctx_with_route(lb_backend(), true);
        assert!(retryable(&ctx, &dial));

        // Non-LB route.
        let ctx = ctx_with_route(
            BackendKind::Static {
                scheme: "http".into(),
                host: "b.internal".into(),
            },
            true,
        );
        assert!(!retryable(&ctx, &dial));

        // Request with a body.
        let ctx = ctx_with_route(lb_backend(), false);
        assert!(!retryable(&ctx, &dial));

        // In-flight failure, not a dial failure.
        let ctx = ctx_with_route(lb_backend(), true);
        let inflight = ProxyError::with_code(
            StatusCode::SERVICE_UNAVAILABLE,
            std::io::Error::other("reset"),
        );
        assert!(!retryable(&ctx, &inflight));

        // Client cancelled.
        let cancel = ProxyError::client_canceled();
        assert!(!retryable(&ctx, &cancel));
    }

    #[test]
    fn breaker_is_keyed_by_outgoing_host_not_filter_input() {
        let proxy = Proxy::with_params(Params {
            breakers: Some(Arc::new(BreakerRegistry::new(None))),
            ..Default::default()
        });

        let settings = |host: &str| BreakerSettings {
            host: host.into(),
            failures: 1,
            timeout: Duration::from_secs(60),
        };

        // A filter pre-populated a host; only its thresholds may count.
        let mut ctx = ctx_with_route(
            BackendKind::Static {
                scheme: "http".into(),
                host: "b.internal".into(),
            },
            true,
        );
        ctx.outgoing_host = "b.internal".into();
        ctx.state.breaker_settings = Some(settings("filter-set.internal"));

        let (done, allow) = proxy.check_breaker(&ctx);
        assert!(allow);
        done.expect("breaker engaged").done(false);

        // Same outgoing host under a different filter-set host must land
        // on the same, now open, breaker.
        let mut ctx = ctx_with_route(
            BackendKind::Static {
                scheme: "http".into(),
                host: "b.internal".into(),
            },
            true,
        );
        ctx.outgoing_host = "b.internal".into();
        ctx.state.breaker_settings = Some(settings("other-filter.internal"));

        let (done, allow) = proxy.check_breaker(&ctx);
        assert!(!allow, "the circuit opened for the outgoing host");
        assert!(done.is_none());
    }
}
