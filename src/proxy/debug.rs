//! Debug-mode response document.
//!
//! A debug proxy does not forward to the backend: it executes the filters
//! and responds with a JSON document describing what they did to the
//! request and would do to the response.

use std::collections::BTreeMap;

use axum::body::Body;
use http::header::CONTENT_TYPE;
use http::{Request, Response, StatusCode};
use serde::Serialize;

use crate::http::request::RequestHead;
use crate::proxy::context::RequestContext;
use crate::proxy::error::ProxyError;

/// Request snapshot as rendered into the debug document.
#[derive(Debug, Clone, Serialize)]
pub struct DebugRequest {
    pub method: String,
    pub uri: String,
    pub host: String,
    pub headers: BTreeMap<String, Vec<String>>,
}

impl DebugRequest {
    pub(crate) fn from_head(head: &RequestHead) -> Self {
        Self {
            method: head.method.to_string(),
            uri: head.uri.to_string(),
            host: head.host.clone(),
            headers: header_map(&head.headers),
        }
    }

    pub(crate) fn from_request<B>(req: &Request<B>) -> Self {
        Self {
            method: req.method().to_string(),
            uri: req.uri().to_string(),
            host: req
                .uri()
                .authority()
                .map(|a| a.to_string())
                .unwrap_or_default(),
            headers: header_map(req.headers()),
        }
    }
}

fn header_map(headers: &http::HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        map.entry(name.to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).to_string());
    }
    map
}

#[derive(Serialize)]
struct DebugDocument {
    route: Option<DebugRoute>,
    incoming: DebugRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    outgoing: Option<DebugRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    filter_panics: Vec<String>,
}

#[derive(Serialize)]
struct DebugRoute {
    id: String,
    backend: String,
}

/// Render the debug document for a finished pipeline run.
pub(crate) fn debug_response(ctx: &RequestContext, err: Option<&ProxyError>) -> Response<Body> {
    let incoming = ctx
        .original_head
        .as_ref()
        .map(DebugRequest::from_head)
        .unwrap_or_else(|| DebugRequest::from_head(&ctx.head));

    let document = DebugDocument {
        route: ctx.route.as_ref().map(|r| DebugRoute {
            id: r.id.clone(),
            backend: format!("{:?}", r.backend),
        }),
        incoming,
        outgoing: ctx.outgoing_debug_request.clone(),
        response_status: ctx.response.as_ref().map(|r| r.status().as_u16()),
        error: err.map(|e| e.to_string()),
        filter_panics: ctx.debug_filter_panics.clone(),
    };

    let body = serde_json::to_vec_pretty(&document).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("static response construction")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use tracing::Span;

    #[test]
    fn document_includes_route_and_panics() {
        let req = http::Request::builder()
            .uri("http://a.example/x")
            .header("x-test", "1")
            .body(())
            .unwrap();
        let head = crate::http::request::snapshot_head(&req, None, false);
        let mut ctx = RequestContext::new(head, Body::empty(), true, Span::none());
        ctx.apply_route(
            std::sync::Arc::new(crate::routing::Route::new(
                "r1",
                crate::routing::BackendKind::Shunt,
            )),
            Default::default(),
            false,
        );
        ctx.debug_filter_panics.push("boom".to_string());

        let rsp = debug_response(&ctx, None);
        assert_eq!(rsp.status(), StatusCode::OK);
        assert_eq!(rsp.headers().get(CONTENT_TYPE).unwrap(), "application/json");
    }
}
