//! HTTP server setup and the entry handler.
//!
//! # Responsibilities
//! - Create the Axum router with the catch-all proxy handler
//! - Per-request context construction and the initial tracing span
//! - Dispatch into the pipeline engine
//! - Divert failures to the error responder

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    response::Response,
    routing::any,
    Router,
};
use http::{StatusCode, Uri};
use tracing::Instrument;

use crate::http::request::{patch_path, snapshot_head};
use crate::observability::metrics;
use crate::proxy::context::RequestContext;
use crate::proxy::Proxy;

/// Build the Axum router serving the proxy.
pub fn router(proxy: Arc<Proxy>) -> Router {
    Router::new()
        .route("/{*path}", any(proxy_handler))
        .route("/", any(proxy_handler))
        .with_state(proxy)
}

/// Run the proxy on a bound listener until shutdown.
pub async fn run(proxy: Arc<Proxy>, listener: tokio::net::TcpListener) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(address = %addr, "proxy listening");

    let app = router(proxy.clone()).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(crate::lifecycle::signal())
        .await?;

    proxy.close();
    tracing::info!("proxy stopped");
    Ok(())
}

/// Main proxy handler: every request enters the pipeline here.
async fn proxy_handler(
    State(proxy): State<Arc<Proxy>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response<Body> {
    proxy.serve(request, Some(addr), false).await
}

impl Proxy {
    /// Serve one inbound request through the pipeline. `tls` tells whether
    /// the inbound connection was TLS-terminated by the caller.
    pub async fn serve(
        &self,
        mut request: Request<Body>,
        remote_addr: Option<SocketAddr>,
        tls: bool,
    ) -> Response<Body> {
        metrics::incr_incoming(request.version());

        // The upgrade token is only present for requests that can switch
        // protocols; the engine hands it to the upgrade helper.
        let on_upgrade = request
            .extensions_mut()
            .remove::<hyper::upgrade::OnUpgrade>();

        let mut head = snapshot_head(&request, remote_addr, tls);
        if self.flags.patch_path {
            if let Some(pq) = head.uri.path_and_query() {
                let patched = patch_path(pq.path());
                if patched != pq.path() {
                    let new_pq = match pq.query() {
                        Some(q) => format!("{patched}?{q}"),
                        None => patched,
                    };
                    let mut parts = head.uri.clone().into_parts();
                    parts.path_and_query = new_pq.parse().ok();
                    if let Ok(uri) = Uri::from_parts(parts) {
                        head.uri = uri;
                    }
                }
            }
        }

        let span = tracing::info_span!(
            "ingress",
            operation = %self.trace_config.initial_span,
            otel.kind = "server",
            component = "waygate",
            http.method = %head.method,
            http.host = %head.host,
            http.path = %head.uri.path(),
            http.remote_ip = %head
                .remote_addr
                .map(|a| a.ip().to_string())
                .unwrap_or_default(),
            hostname = %self.hostname,
            flow_id = head.flow_id().unwrap_or(""),
            http.status_code = tracing::field::Empty,
            error = tracing::field::Empty,
        );

        let body = request.into_body();
        let mut ctx = RequestContext::new(head, body, self.flags.preserve_original(), span.clone());
        ctx.on_upgrade = on_upgrade;
        ctx.watch_inbound_body();

        let result = self.execute(&mut ctx).instrument(span).await;

        match result {
            Ok(()) => self.serve_response(ctx),
            Err(err) => match self.error_response(&mut ctx, &err) {
                Some(response) => self.finalize(ctx, response),
                None => {
                    // Already handled in a non-standard way; emit whatever
                    // response the pipeline assembled, or an empty one.
                    let response = ctx.response.take().unwrap_or_else(|| {
                        let mut r = Response::new(Body::empty());
                        *r.status_mut() = StatusCode::OK;
                        r
                    });
                    self.finalize(ctx, response)
                }
            },
        }
    }
}
