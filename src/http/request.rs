//! Request head handling and transformation helpers.
//!
//! # Responsibilities
//! - Snapshot the inbound request head into a cloneable descriptor
//! - Extract routing-relevant information (host, path, remote address)
//! - Hop-by-hop header knowledge (RFC 2616 13.5.1)
//! - RFC 3986 path patching for reserved characters

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName};
use http::{Method, Uri, Version};
use http_body::Frame;
use http_body_util::BodyExt;

/// Correlation id header consumed by logs and traces.
pub const FLOW_ID_HEADER: &str = "x-flow-id";

/// Hop-by-hop headers that must not be forwarded through a proxy.
pub const HOP_HEADERS: [&str; 9] = [
    "te",
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Returns true for headers scoped to a single connection.
pub fn is_hop_header(name: &HeaderName) -> bool {
    HOP_HEADERS.contains(&name.as_str())
}

/// Cloneable snapshot of the inbound request head.
///
/// The pipeline owns one per request; filters mutate it in place and the
/// request mapper derives the outbound request from it. Loopback routes
/// clone it for the inner pipeline run.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    /// Host the client addressed, from the request target or Host header.
    pub host: String,
    /// Peer address of the inbound connection.
    pub remote_addr: Option<SocketAddr>,
    /// True when TLS terminated the inbound connection.
    pub tls: bool,
}

impl RequestHead {
    /// Scheme implied by the inbound connection.
    pub fn scheme(&self) -> &'static str {
        if self.tls {
            "https"
        } else {
            "http"
        }
    }

    /// Value of the `X-Flow-Id` header, if present.
    pub fn flow_id(&self) -> Option<&str> {
        self.headers.get(FLOW_ID_HEADER).and_then(|v| v.to_str().ok())
    }

    /// User agent header value, empty when absent.
    pub fn user_agent(&self) -> &str {
        self.headers
            .get(http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    /// Whether the request carries no body worth replaying.
    ///
    /// A request is treated as bodyless when it declares `Content-Length: 0`
    /// or carries neither a content length nor a transfer encoding.
    pub fn has_no_body(&self) -> bool {
        match self.content_length() {
            Some(n) => n == 0,
            None => !self.headers.contains_key(http::header::TRANSFER_ENCODING),
        }
    }

    /// Declared content length, if parseable.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }

    /// The remote host of the client, honouring `X-Forwarded-For`.
    pub fn remote_host(&self) -> String {
        if let Some(ff) = self
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            if !ff.is_empty() {
                return strip_port(ff).to_string();
            }
        }
        self.remote_addr
            .map(|a| a.ip().to_string())
            .unwrap_or_default()
    }

    /// Request line without the query, for error logs.
    pub fn request_line(&self) -> String {
        format!("{} {} {:?}", self.method, self.uri.path(), self.version)
    }
}

/// Build a request head from an inbound hyper request.
pub fn snapshot_head<B>(req: &http::Request<B>, remote_addr: Option<SocketAddr>, tls: bool) -> RequestHead {
    // Credentials embedded in an absolute-form target stay out of the
    // host; the mapper turns them into an Authorization header.
    let host = req
        .uri()
        .authority()
        .map(|a| match a.as_str().rsplit_once('@') {
            Some((_, host)) => host.to_string(),
            None => a.to_string(),
        })
        .or_else(|| {
            req.headers()
                .get(http::header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
        })
        .unwrap_or_default();

    RequestHead {
        method: req.method().clone(),
        uri: req.uri().clone(),
        version: req.version(),
        headers: req.headers().clone(),
        host,
        remote_addr,
        tls,
    }
}

/// Strip the port from an address with hostname, ipv4 or ipv6.
pub fn strip_port(address: &str) -> &str {
    let address = address.trim();
    if let Some(rest) = address.strip_prefix('[') {
        // Bracketed ipv6 literal.
        return rest.split(']').next().unwrap_or(address);
    }
    // A bare ipv6 address contains multiple colons and carries no port.
    if address.matches(':').count() > 1 {
        return address;
    }
    address.split(':').next().unwrap_or(address)
}

/// Normalize percent-escapes in a path per RFC 3986: unreserved characters
/// are unescaped, reserved characters keep their escaped form.
pub fn patch_path(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut out = String::with_capacity(path.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = &path[i + 1..i + 3];
            if let Ok(v) = u8::from_str_radix(hex, 16) {
                if v.is_ascii_alphanumeric() || matches!(v, b'-' | b'.' | b'_' | b'~') {
                    out.push(v as char);
                } else {
                    out.push('%');
                    out.push_str(&hex.to_ascii_uppercase());
                }
                i += 3;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

/// Read a body to completion, discarding the data.
///
/// Used on shunt and circuit-open paths to release the inbound connection.
pub async fn drain_body(mut body: Body) {
    while let Some(frame) = body.frame().await {
        if frame.is_err() {
            break;
        }
    }
}

/// Inbound body wrapper that raises the shared flag when a read fails,
/// which on the server side means the client went away mid-request. The
/// pipeline consults the flag before writing the response head.
pub(crate) struct WatchedBody {
    inner: Body,
    client_gone: Arc<AtomicBool>,
}

impl WatchedBody {
    pub(crate) fn wrap(inner: Body, client_gone: Arc<AtomicBool>) -> Body {
        Body::new(Self { inner, client_gone })
    }
}

impl http_body::Body for WatchedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Err(err))) => {
                this.client_gone.store(true, Ordering::Relaxed);
                Poll::Ready(Some(Err(err)))
            }
            other => other,
        }
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}
