//! Response finalisation and streaming.
//!
//! # Responsibilities
//! - Write the response head after a client-gone check
//! - Forward the body frame by frame, counting bytes and errors
//! - Run the deferred per-request actions when the body completes:
//!   serve metric, access log entry, span finishing

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, Response, StatusCode};
use http_body::Frame;
use tracing::Span;

use crate::observability::logging::{log_access, should_log, AccessEntry, AccessLogFilter};
use crate::observability::metrics;
use crate::proxy::context::RequestContext;
use crate::proxy::{debug, Proxy, UNKNOWN_ROUTE_ID};

/// Branding header set on every response that does not carry one already.
pub(crate) fn add_branding(headers: &mut HeaderMap) {
    let server = http::header::SERVER;
    let unset = headers
        .get(&server)
        .map(|v| v.is_empty())
        .unwrap_or(true);
    if unset {
        headers.insert(server, HeaderValue::from_static("waygate"));
    }
}

impl Proxy {
    /// Turn a successfully finished pipeline run into the client response.
    pub(crate) fn serve_response(&self, mut ctx: RequestContext) -> Response<Body> {
        if self.flags.debug {
            let response = debug::debug_response(&ctx, None);
            return self.finalize(ctx, response);
        }

        let mut response = ctx.response.take().unwrap_or_else(|| {
            // The engine guarantees a response on the success path.
            let mut r = Response::new(Body::empty());
            *r.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            r
        });

        if ctx.client_gone() {
            // The client closed the request while it was being served.
            *response.status_mut() = StatusCode::from_u16(499).expect("non-standard 499");
            if let Some(span) = &ctx.proxy_span {
                span.record("error", true);
            }
        }

        ctx.initial_span
            .record("http.status_code", response.status().as_u16());
        if self.trace_config.log_stream_events {
            tracing::debug!(stream = "headers", "streaming response headers");
        }

        self.finalize(ctx, response)
    }

    /// Attach the per-request finalisation to the response body. Runs for
    /// every response the proxy emits, exactly once per request.
    pub(crate) fn finalize(&self, mut ctx: RequestContext, response: Response<Body>) -> Response<Body> {
        let status = response.status().as_u16();
        let route_id = ctx
            .route
            .as_ref()
            .map(|r| r.id.clone())
            .unwrap_or_else(|| UNKNOWN_ROUTE_ID.to_string());

        let log_decision = ctx.state.access_log.clone().unwrap_or_else(|| {
            if self.access_log_disabled {
                AccessLogFilter::disabled()
            } else {
                AccessLogFilter::enabled()
            }
        });

        let finalizer = ServeFinalizer {
            route_id: route_id.clone(),
            metrics_host: metrics::metrics_host(&ctx.head.host),
            method: ctx.head.method.clone(),
            path: ctx.head.uri.path().to_string(),
            proto: metrics::proto(ctx.head.version),
            status,
            start_serve: ctx.start_serve,
            remote_host: ctx.head.remote_host(),
            flow_id: ctx.head.flow_id().map(|s| s.to_string()),
            user_agent: ctx.head.user_agent().to_string(),
            additional: ctx.state.access_log_data.take(),
            log_decision,
            response_size: 0,
            proxy_span: ctx.proxy_span.take(),
            initial_span: ctx.initial_span.clone(),
        };

        let (parts, body) = response.into_parts();
        let tracked = TrackedBody {
            inner: body,
            route_id,
            status,
            method: finalizer.method.clone(),
            stream_start: Instant::now(),
            bytes: 0,
            log_stream_events: self.trace_config.log_stream_events,
            completed: false,
            finalizer,
        };
        Response::from_parts(parts, Body::new(tracked))
    }
}

/// Deferred per-request actions, run when the response body is done (or
/// dropped on client disconnect): serve metric, access log entry, span
/// finishing. Field order finishes the backend span before the initial one.
struct ServeFinalizer {
    route_id: String,
    metrics_host: String,
    method: Method,
    path: String,
    proto: &'static str,
    status: u16,
    start_serve: Instant,
    remote_host: String,
    flow_id: Option<String>,
    user_agent: String,
    additional: Option<serde_json::Map<String, serde_json::Value>>,
    log_decision: AccessLogFilter,
    response_size: u64,
    proxy_span: Option<Span>,
    initial_span: Span,
}

impl Drop for ServeFinalizer {
    fn drop(&mut self) {
        metrics::measure_serve(
            &self.route_id,
            &self.metrics_host,
            &self.method,
            self.status,
            self.start_serve,
        );

        if should_log(self.status, &self.log_decision) {
            log_access(&AccessEntry {
                method: self.method.clone(),
                path: std::mem::take(&mut self.path),
                proto: self.proto,
                status: self.status,
                response_size: self.response_size,
                remote_host: std::mem::take(&mut self.remote_host),
                duration: self.start_serve.elapsed(),
                flow_id: self.flow_id.take(),
                user_agent: std::mem::take(&mut self.user_agent),
                additional: self.additional.take(),
            });
        }

        // The span handles drop with the finalizer: backend span first,
        // then the initial span, each finished exactly once.
    }
}

/// Body wrapper counting bytes and accounting streaming errors while the
/// response is pumped to the client.
struct TrackedBody {
    inner: Body,
    route_id: String,
    status: u16,
    method: Method,
    stream_start: Instant,
    bytes: u64,
    log_stream_events: bool,
    completed: bool,
    finalizer: ServeFinalizer,
}

impl http_body::Body for TrackedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.bytes += data.len() as u64;
                    this.finalizer.response_size = this.bytes;
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(err))) => {
                // Headers are already sent, the error cannot reach the
                // client as a status.
                metrics::incr_errors_streaming(&this.route_id);
                tracing::debug!(
                    route = %this.route_id,
                    error = %err,
                    "error while copying the response stream"
                );
                if let Some(span) = &this.finalizer.proxy_span {
                    span.record("error", true);
                }
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                if !this.completed {
                    this.completed = true;
                    metrics::measure_response(
                        this.status,
                        &this.method,
                        &this.route_id,
                        this.stream_start,
                    );
                    if this.log_stream_events {
                        tracing::debug!(stream = "body", bytes = this.bytes, "stream end");
                    }
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}
