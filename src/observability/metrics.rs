//! Metrics collection and exposition.
//!
//! The dotted metric names recorded here are external contracts consumed by
//! dashboards and alerts; changing them is a breaking change.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Initialize metrics exporter and scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus recorder");

    tracing::info!("metrics server listening on http://{}", addr);
}

/// Protocol label of a request, e.g. `HTTP/1.1`.
pub fn proto(version: http::Version) -> &'static str {
    match version {
        http::Version::HTTP_09 => "HTTP/0.9",
        http::Version::HTTP_10 => "HTTP/1.0",
        http::Version::HTTP_11 => "HTTP/1.1",
        http::Version::HTTP_2 => "HTTP/2.0",
        http::Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP",
    }
}

pub fn incr_incoming(version: http::Version) {
    counter!(format!("incoming.{}", proto(version))).increment(1);
}

pub fn incr_outgoing(version: http::Version) {
    counter!(format!("outgoing.{}", proto(version))).increment(1);
}

pub fn incr_routing_failures() {
    counter!("routing.failures").increment(1);
}

pub fn incr_errors_backend(route: &str) {
    counter!(format!("errors.backend.{route}")).increment(1);
}

pub fn incr_errors_streaming(route: &str) {
    counter!(format!("errors.streaming.{route}")).increment(1);
}

pub fn measure_route_lookup(start: Instant) {
    histogram!("routelookup").record(start.elapsed().as_secs_f64());
}

pub fn measure_filter_request(name: &str, start: Instant) {
    histogram!(format!("filter.request.{name}")).record(start.elapsed().as_secs_f64());
}

pub fn measure_filter_response(name: &str, start: Instant) {
    histogram!(format!("filter.response.{name}")).record(start.elapsed().as_secs_f64());
}

pub fn measure_all_filters_request(route: &str, start: Instant) {
    histogram!(format!("allfilters.request.{route}")).record(start.elapsed().as_secs_f64());
}

pub fn measure_all_filters_response(route: &str, start: Instant) {
    histogram!(format!("allfilters.response.{route}")).record(start.elapsed().as_secs_f64());
}

pub fn measure_backend(route: &str, start: Instant) {
    histogram!(format!("backend.{route}")).record(start.elapsed().as_secs_f64());
}

pub fn measure_backend_host(host: &str, start: Instant) {
    if !host.is_empty() {
        histogram!(format!("backendhost.{host}")).record(start.elapsed().as_secs_f64());
    }
}

pub fn measure_backend_5xx(start: Instant) {
    histogram!("backend5xx").record(start.elapsed().as_secs_f64());
}

pub fn measure_response(status: u16, method: &http::Method, route: &str, start: Instant) {
    histogram!(format!("response.{status}.{method}.{route}"))
        .record(start.elapsed().as_secs_f64());
}

pub fn measure_serve(route: &str, host: &str, method: &http::Method, status: u16, start: Instant) {
    histogram!(format!("serve.{route}.{host}.{method}.{status}"))
        .record(start.elapsed().as_secs_f64());
}

/// Host part of a serve metric key: dots collide with the name separator.
pub fn metrics_host(host: &str) -> String {
    host.replace(['.', ':'], "_")
}
