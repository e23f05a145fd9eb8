//! Tracing configuration and trace context passthrough.
//!
//! Spans themselves are created where the work happens (entry handler,
//! backend call); this module carries the knobs and the thin pieces shared
//! between them.

use http::HeaderMap;

/// Headers carrying distributed trace context across hops.
const TRACE_CONTEXT_HEADERS: [&str; 3] = ["traceparent", "tracestate", "x-flow-id"];

/// Tracing behaviour of a proxy instance.
#[derive(Debug, Clone)]
pub struct TraceConfig {
    /// Operation name of the initial, pre-routing span.
    pub initial_span: String,
    /// Disables the spans representing request and response filter phases.
    pub disable_filter_spans: bool,
    /// Mark start and completion of each filter on the filter span.
    pub log_filter_events: bool,
    /// Log when response headers and payload are streamed to the client.
    pub log_stream_events: bool,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            initial_span: "ingress".to_string(),
            disable_filter_spans: false,
            log_filter_events: false,
            log_stream_events: false,
        }
    }
}

/// Propagate inbound trace context onto the outbound request headers.
pub fn inject_trace_headers(inbound: &HeaderMap, outbound: &mut HeaderMap) {
    for name in TRACE_CONTEXT_HEADERS {
        if !outbound.contains_key(name) {
            if let Some(value) = inbound.get(name) {
                if let Ok(header_name) = http::header::HeaderName::from_bytes(name.as_bytes()) {
                    outbound.insert(header_name, value.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_headers_are_forwarded_not_overwritten() {
        let mut inbound = HeaderMap::new();
        inbound.insert("traceparent", "00-abc-def-01".parse().unwrap());
        inbound.insert("x-flow-id", "flow-1".parse().unwrap());

        let mut outbound = HeaderMap::new();
        outbound.insert("x-flow-id", "already-set".parse().unwrap());

        inject_trace_headers(&inbound, &mut outbound);
        assert_eq!(outbound.get("traceparent").unwrap(), "00-abc-def-01");
        assert_eq!(outbound.get("x-flow-id").unwrap(), "already-set");
    }
}
