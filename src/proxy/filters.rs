//! Filter chain execution.
//!
//! # Responsibilities
//! - Run request filters in declared order, response filters in reverse
//!   over exactly the prefix that executed on the request path
//! - Isolate filter panics from the pipeline
//! - Per-filter and per-route phase timing metrics

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::observability::metrics;
use crate::proxy::context::RequestContext;
use crate::proxy::Proxy;

/// Process-wide cap on panic backtrace capture: only the first filter panic
/// pays for a full backtrace, later ones record the payload only.
static CAUGHT_PANIC: AtomicBool = AtomicBool::new(false);

/// Run `f`, returning the panic payload and, for the first panic in the
/// process, a captured backtrace, if `f` panicked.
fn try_catch(f: impl FnOnce()) -> Option<(String, String)> {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        let backtrace = if !CAUGHT_PANIC.swap(true, Ordering::SeqCst) {
            std::backtrace::Backtrace::force_capture().to_string()
        } else {
            String::new()
        };
        Some((message, backtrace))
    } else {
        None
    }
}

impl Proxy {
    /// Apply the route's filters to the request, in declared order.
    ///
    /// Returns the number of filters that ran; a shunt signal stops the
    /// chain and the response phase covers only that prefix.
    pub(crate) fn apply_filters_to_request(&self, ctx: &mut RequestContext) -> usize {
        let route = match &ctx.route {
            Some(route) => route.clone(),
            None => return 0,
        };
        if route.filters.is_empty() {
            return 0;
        }

        let phase_span = (!self.trace_config.disable_filter_spans)
            .then(|| tracing::debug_span!("request_filters", route = %route.id));
        let _phase = phase_span.as_ref().map(|s| s.enter());

        let phase_start = Instant::now();
        let mut processed = 0;
        for filter in &route.filters {
            let start = Instant::now();
            if self.trace_config.log_filter_events {
                tracing::debug!(filter = filter.name(), phase = "request", "filter start");
            }
            let panicked = try_catch(|| {
                filter.request(ctx);
                metrics::measure_filter_request(filter.name(), start);
            });
            if let Some((payload, backtrace)) = panicked {
                if self.flags.debug {
                    ctx.debug_filter_panics.push(payload);
                } else {
                    tracing::error!(
                        filter = filter.name(),
                        panic = %payload,
                        backtrace = %backtrace,
                        "panic while processing filter during request"
                    );
                }
            }
            if self.trace_config.log_filter_events {
                tracing::debug!(filter = filter.name(), phase = "request", "filter done");
            }

            processed += 1;
            if ctx.deprecated_shunted() || ctx.shunted() {
                break;
            }
        }

        metrics::measure_all_filters_request(&route.id, phase_start);
        processed
    }

    /// Apply the executed request-filter prefix to the response, reversed.
    pub(crate) fn apply_filters_to_response(&self, ctx: &mut RequestContext, processed: usize) {
        let route = match &ctx.route {
            Some(route) => route.clone(),
            None => return,
        };
        if processed == 0 {
            return;
        }

        let phase_span = (!self.trace_config.disable_filter_spans)
            .then(|| tracing::debug_span!("response_filters", route = %route.id));
        let _phase = phase_span.as_ref().map(|s| s.enter());

        let phase_start = Instant::now();
        for filter in route.filters[..processed].iter().rev() {
            let start = Instant::now();
            if self.trace_config.log_filter_events {
                tracing::debug!(filter = filter.name(), phase = "response", "filter start");
            }
            let panicked = try_catch(|| {
                filter.response(ctx);
                metrics::measure_filter_response(filter.name(), start);
            });
            if let Some((payload, backtrace)) = panicked {
                if self.flags.debug {
                    ctx.debug_filter_panics.push(payload);
                } else {
                    tracing::error!(
                        filter = filter.name(),
                        panic = %payload,
                        backtrace = %backtrace,
                        "panic while processing filter during response"
                    );
                }
            }
            if self.trace_config.log_filter_events {
                tracing::debug!(filter = filter.name(), phase = "response", "filter done");
            }
        }

        metrics::measure_all_filters_response(&route.id, phase_start);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::body::Body;
    use tracing::Span;

    use crate::proxy::{Params, Proxy};
    use crate::routing::{BackendKind, Filter, Route};

    struct Recording {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        panic_on_request: bool,
        shunt_on_request: bool,
    }

    impl Filter for Recording {
        fn name(&self) -> &str {
            &self.name
        }

        fn request(&self, ctx: &mut RequestContext) {
            self.log.lock().unwrap().push(format!("req:{}", self.name));
            if self.panic_on_request {
                panic!("{} misbehaved", self.name);
            }
            if self.shunt_on_request {
                ctx.shunt();
            }
        }

        fn response(&self, _ctx: &mut RequestContext) {
            self.log.lock().unwrap().push(format!("rsp:{}", self.name));
        }
    }

    fn recording(
        name: &str,
        log: &Arc<Mutex<Vec<String>>>,
        panic_on_request: bool,
        shunt_on_request: bool,
    ) -> Arc<dyn Filter> {
        Arc::new(Recording {
            name: name.to_string(),
            log: log.clone(),
            panic_on_request,
            shunt_on_request,
        })
    }

    fn ctx_with_filters(filters: Vec<Arc<dyn Filter>>) -> RequestContext {
        let req = http::Request::builder()
            .uri("http://a.example/x")
            .body(())
            .unwrap();
        let head = crate::http::request::snapshot_head(&req, None, false);
        let mut ctx = RequestContext::new(head, Body::empty(), false, Span::none());
        let route = Arc::new(Route::new("r1", BackendKind::Shunt).with_filters(filters));
        ctx.apply_route(route, Default::default(), false);
        ctx
    }

    fn proxy() -> Arc<Proxy> {
        Proxy::with_params(Params::default())
    }

    #[test]
    fn response_phase_reverses_executed_prefix() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = ctx_with_filters(vec![
            recording("a", &log, false, false),
            recording("b", &log, false, true),
            recording("c", &log, false, false),
        ]);
        let p = proxy();

        let processed = p.apply_filters_to_request(&mut ctx);
        assert_eq!(processed, 2, "shunt stops the request phase");
        p.apply_filters_to_response(&mut ctx, processed);

        assert_eq!(
            *log.lock().unwrap(),
            vec!["req:a", "req:b", "rsp:b", "rsp:a"]
        );
    }

    #[test]
    fn panic_does_not_stop_the_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = ctx_with_filters(vec![
            recording("a", &log, true, false),
            recording("b", &log, false, false),
        ]);
        let p = proxy();

        let processed = p.apply_filters_to_request(&mut ctx);
        assert_eq!(processed, 2);
        p.apply_filters_to_response(&mut ctx, processed);

        assert_eq!(
            *log.lock().unwrap(),
            vec!["req:a", "req:b", "rsp:b", "rsp:a"]
        );
    }

    #[test]
    fn debug_mode_collects_panics() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = ctx_with_filters(vec![recording("a", &log, true, false)]);
        let p = Proxy::with_params(Params {
            flags: crate::proxy::Flags {
                debug: true,
                ..Default::default()
            },
            ..Default::default()
        });

        p.apply_filters_to_request(&mut ctx);
        assert_eq!(ctx.debug_filter_panics.len(), 1);
        assert!(ctx.debug_filter_panics[0].contains("a misbehaved"));
    }
}
