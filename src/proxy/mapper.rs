//! Outbound request construction.
//!
//! # Responsibilities
//! - Resolve the destination scheme/host per backend kind
//! - Copy headers, optionally dropping hop-by-hop ones
//! - Carry basic auth embedded in the request URL
//! - Compute the outbound Host header
//! - Rewrite the target when the backend is itself an HTTP proxy

use std::sync::Arc;

use axum::body::Body;
use base64::Engine;
use http::header::{AUTHORIZATION, HOST, USER_AGENT};
use http::{HeaderMap, HeaderValue, Request, Uri};

use crate::http::request::is_hop_header;
use crate::load_balancer::{LbContext, LbEndpoint};
use crate::proxy::context::RequestContext;
use crate::proxy::error::ProxyError;
use crate::proxy::transport::OutboundRequest;
use crate::proxy::Flags;
use crate::routing::BackendKind;

/// The outbound request plus the endpoint selected for it, when the route
/// is load balanced. The engine tracks the endpoint's inflight counter
/// around the backend call.
pub(crate) struct MappedRequest {
    pub outbound: OutboundRequest,
    pub endpoint: Option<Arc<LbEndpoint>>,
}

/// Build the outbound request from the context.
pub(crate) fn map_request(
    ctx: &mut RequestContext,
    flags: &Flags,
) -> Result<MappedRequest, ProxyError> {
    let route = ctx
        .route
        .clone()
        .ok_or_else(|| ProxyError::map(simple_err("no route applied")))?;

    let mut endpoint = None;
    let (scheme, host) = match &route.backend {
        BackendKind::Static { scheme, host } => (scheme.clone(), host.clone()),
        BackendKind::LoadBalanced {
            algorithm,
            endpoints,
        } => {
            let selected = algorithm
                .select(
                    endpoints,
                    &LbContext {
                        head: &ctx.head,
                        route_id: &route.id,
                        state: &ctx.state,
                    },
                )
                .ok_or_else(|| {
                    ProxyError::with_code(
                        http::StatusCode::SERVICE_UNAVAILABLE,
                        simple_err("no healthy endpoint available"),
                    )
                })?;
            let pair = (selected.scheme.clone(), selected.host.clone());
            endpoint = Some(selected);
            pair
        }
        // Dynamic backends start from the inbound request; shunt and
        // loopback routes are only mapped for debug inspection and resolve
        // the same way.
        _ => dynamic_destination(ctx),
    };

    let (proxy, scheme, host) = if ctx.state.backend_is_proxy {
        let proxy_uri: Uri = format!("{scheme}://{host}")
            .parse()
            .map_err(ProxyError::map)?;
        (
            Some(proxy_uri),
            ctx.head.scheme().to_string(),
            ctx.head.host.clone(),
        )
    } else {
        (None, scheme, host)
    };

    let path_and_query = ctx
        .head
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri: Uri = format!("{scheme}://{host}{path_and_query}")
        .parse()
        .map_err(ProxyError::map)?;

    let mut headers = if flags.hop_headers_removal {
        copy_headers_excluding_hop(&ctx.head.headers)
    } else {
        ctx.head.headers.clone()
    };

    // Suppress any transport default user agent when none was sent.
    if !headers.contains_key(USER_AGENT) {
        headers.insert(USER_AGENT, HeaderValue::from_static(""));
    }

    // Basic auth embedded in the inbound request target.
    if let Some(userinfo) = userinfo(&ctx.head.uri) {
        let encoded = base64::engine::general_purpose::STANDARD.encode(userinfo);
        if let Ok(value) = HeaderValue::from_str(&format!("Basic {encoded}")) {
            headers.append(AUTHORIZATION, value);
        }
    }

    headers.remove(HOST);
    let host_header = if ctx.outgoing_host.is_empty() {
        uri.authority().map(|a| a.as_str().to_string())
    } else {
        Some(ctx.outgoing_host.clone())
    };
    if let Some(h) = host_header {
        if let Ok(value) = HeaderValue::from_str(&h) {
            headers.insert(HOST, value);
        }
    }

    // An empty declared body must not turn into chunked encoding.
    let body = if ctx.no_body {
        Body::empty()
    } else {
        ctx.body.take().unwrap_or_else(Body::empty)
    };

    let mut request = Request::builder()
        .method(ctx.head.method.clone())
        .uri(uri)
        .body(body)
        .map_err(ProxyError::map)?;
    *request.headers_mut() = headers;

    Ok(MappedRequest {
        outbound: OutboundRequest {
            request,
            proxy,
            remote_addr: ctx.head.remote_addr,
            fastcgi_filename: ctx.state.fastcgi_filename.clone(),
        },
        endpoint,
    })
}

/// Scheme and host for a dynamic backend: start from the inbound request,
/// then apply state-bag overrides in priority order.
fn dynamic_destination(ctx: &RequestContext) -> (String, String) {
    let mut scheme = ctx.head.scheme().to_string();
    let mut host = ctx.head.host.clone();

    if let Some(url) = &ctx.state.dynamic_backend_url {
        if let Ok(uri) = url.parse::<Uri>() {
            if let (Some(s), Some(a)) = (uri.scheme_str(), uri.authority()) {
                scheme = s.to_string();
                host = a.to_string();
                return (scheme, host);
            }
        }
    }
    if let Some(h) = &ctx.state.dynamic_backend_host {
        if !h.is_empty() {
            host = h.clone();
        }
    }
    if let Some(s) = &ctx.state.dynamic_backend_scheme {
        if !s.is_empty() {
            scheme = s.clone();
        }
    }
    (scheme, host)
}

fn copy_headers_excluding_hop(from: &HeaderMap) -> HeaderMap {
    let mut to = HeaderMap::with_capacity(from.len());
    for (name, value) in from {
        if !is_hop_header(name) {
            to.append(name.clone(), value.clone());
        }
    }
    to
}

fn userinfo(uri: &Uri) -> Option<&str> {
    let authority = uri.authority()?.as_str();
    authority.rsplit_once('@').map(|(user, _)| user)
}

fn simple_err(msg: &'static str) -> std::io::Error {
    std::io::Error::other(msg)
}
