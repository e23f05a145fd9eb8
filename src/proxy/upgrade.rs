//! Protocol upgrade detection and the pluggable upgrade helper.
//!
//! The engine only detects upgrade requests and delegates; the raw TCP
//! bridging helper is an external collaborator supplied through
//! [`UpgradeHandler`]. Upgrades traverse the normal path unless the
//! experimental upgrade feature is enabled on the proxy.

use async_trait::async_trait;
use axum::body::Body;
use http::{Request, Response};

use crate::proxy::error::ProxyError;
use crate::proxy::transport::OutboundRequest;

/// True when the request asks to switch protocols (RFC 7230 6.7).
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let connection_upgrade = req
        .headers()
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false);
    connection_upgrade && req.headers().contains_key(http::header::UPGRADE)
}

/// Requested upgrade protocol, for logs.
pub fn upgrade_protocol<B>(req: &Request<B>) -> String {
    req.headers()
        .get(http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

/// External helper bridging an upgraded connection to the backend.
///
/// Receives the mapped outbound request and the upgrade token of the
/// inbound connection; returns the switching-protocols response to write
/// to the client. Once the client connection upgrades, the helper owns
/// both sockets.
#[async_trait]
pub trait UpgradeHandler: Send + Sync {
    async fn serve(
        &self,
        outbound: OutboundRequest,
        on_upgrade: hyper::upgrade::OnUpgrade,
    ) -> Result<Response<Body>, ProxyError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_websocket_upgrade() {
        let req = http::Request::builder()
            .uri("/ws")
            .header("connection", "keep-alive, Upgrade")
            .header("upgrade", "websocket")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&req));
        assert_eq!(upgrade_protocol(&req), "websocket");
    }

    #[test]
    fn plain_requests_are_not_upgrades() {
        let req = http::Request::builder()
            .uri("/x")
            .header("connection", "keep-alive")
            .body(())
            .unwrap();
        assert!(!is_upgrade_request(&req));

        let req = http::Request::builder()
            .uri("/x")
            .header("upgrade", "websocket")
            .body(())
            .unwrap();
        assert!(!is_upgrade_request(&req), "upgrade needs the connection token");
    }
}
