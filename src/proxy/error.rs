//! Pipeline error type and the terminal error response.
//!
//! `ProxyError` carries what the entry handler needs to emit exactly one
//! response for a failed request: the required status code, whether the
//! response was already written in a non-standard way, whether the failure
//! happened before any HTTP was sent (safe to retry), and headers to merge
//! onto the terminal response.

use std::error::Error as StdError;
use std::fmt;

use axum::body::Body;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, Response, StatusCode};

use crate::http::response::add_branding;
use crate::proxy::context::RequestContext;
use crate::proxy::Proxy;
use crate::security::RatelimitExceeded;

/// Error raised while proxying a request.
pub struct ProxyError {
    message: String,
    source: Option<Box<dyn StdError + Send + Sync>>,
    code: Option<StatusCode>,
    dialing_failed: bool,
    handled: bool,
    route_lookup_failed: bool,
    additional_header: Option<HeaderMap>,
}

impl ProxyError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
            code: None,
            dialing_failed: false,
            handled: false,
            route_lookup_failed: false,
            additional_header: None,
        }
    }

    /// No route matched the request.
    pub fn route_lookup_failed() -> Self {
        let mut e = Self::new("route lookup failed");
        e.route_lookup_failed = true;
        e
    }

    /// The loopback budget was exhausted.
    pub fn max_loopbacks() -> Self {
        Self::new("max loopbacks reached")
    }

    /// The global rate limit rejected the request.
    pub fn ratelimited(exceeded: RatelimitExceeded) -> Self {
        let mut e = Self::new("ratelimited");
        e.code = Some(StatusCode::TOO_MANY_REQUESTS);
        e.additional_header = Some(exceeded.headers());
        e
    }

    /// The circuit breaker is open for this route.
    pub fn circuit_open() -> Self {
        let mut e = Self::new("circuit breaker open");
        e.code = Some(StatusCode::SERVICE_UNAVAILABLE);
        let mut headers = HeaderMap::new();
        headers.insert("x-circuit-open", http::HeaderValue::from_static("true"));
        e.additional_header = Some(headers);
        e
    }

    /// The response was already emitted in a non-standard way.
    pub fn handled() -> Self {
        let mut e = Self::new("request handled in a non-standard way");
        e.handled = true;
        e
    }

    /// The outbound request could not be constructed.
    pub fn map(err: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        let err = err.into();
        let mut e = Self::new(format!("could not map backend request: {err}"));
        e.source = Some(err);
        e
    }

    /// Failure before any HTTP was sent on the backend socket.
    pub fn dial(err: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        let err = err.into();
        let mut e = Self::new(format!("dialing failed: {err}"));
        e.source = Some(err);
        e.dialing_failed = true;
        e
    }

    /// Failure with an explicit response status.
    pub fn with_code(code: StatusCode, err: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        let err = err.into();
        let mut e = Self::new(err.to_string());
        e.source = Some(err);
        e.code = Some(code);
        e
    }

    /// Unexpected transport failure without a clearer classification.
    pub fn backend(err: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        let err = err.into();
        let mut e = Self::new(format!("unexpected error during backend roundtrip: {err}"));
        e.source = Some(err);
        e
    }

    /// Client closed the request before the backend answered.
    pub fn client_canceled() -> Self {
        let mut e = Self::new("client canceled the request");
        e.code = Some(StatusCode::from_u16(499).expect("non-standard 499"));
        e
    }

    /// Prefix the message with round-trip context.
    pub fn wrap_backend(mut self, host: &str) -> Self {
        self.message = format!("failed to do backend roundtrip to {host}: {}", self.message);
        self
    }

    /// Terminal status for this error, given the proxy's default for
    /// route-lookup failures.
    pub fn status(&self, route_lookup_status: StatusCode) -> StatusCode {
        if self.route_lookup_failed {
            route_lookup_status
        } else if let Some(code) = self.code {
            code
        } else if self.dialing_failed {
            StatusCode::BAD_GATEWAY
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }

    pub fn is_handled(&self) -> bool {
        self.handled
    }

    /// True if the error happened while dialing, before HTTP data was sent.
    /// It is safe to retry a call if this returns true.
    pub fn dialing_failed(&self) -> bool {
        self.dialing_failed
    }

    pub fn is_route_lookup_failed(&self) -> bool {
        self.route_lookup_failed
    }

    pub fn code(&self) -> Option<StatusCode> {
        self.code
    }

    pub fn additional_header(&self) -> Option<&HeaderMap> {
        self.additional_header.as_ref()
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl fmt::Debug for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyError")
            .field("message", &self.message)
            .field("code", &self.code)
            .field("dialing_failed", &self.dialing_failed)
            .field("handled", &self.handled)
            .finish()
    }
}

impl StdError for ProxyError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

/// A plain-text terminal response for a status code.
pub(crate) fn plain_status_response(code: StatusCode) -> Response<Body> {
    let text = format!(
        "{}\n",
        code.canonical_reason().unwrap_or("Internal Server Error")
    );
    let mut response = Response::builder()
        .status(code)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .header("x-content-type-options", "nosniff")
        .header(CONTENT_LENGTH, text.len())
        .body(Body::from(text))
        .expect("static response construction");
    add_branding(response.headers_mut());
    response
}

impl Proxy {
    /// Map an engine error to the terminal response. Returns `None` when the
    /// response was already emitted (upgrade hijack, deprecated shunt).
    pub(crate) fn error_response(
        &self,
        ctx: &mut RequestContext,
        err: &ProxyError,
    ) -> Option<Response<Body>> {
        if err.is_handled() {
            return None;
        }

        let (route_id, backend_type, backend) = match &ctx.route {
            Some(route) => (
                route.id.clone(),
                route.backend.label(),
                format!("{}://{}", ctx.head.scheme(), ctx.head.host),
            ),
            None => (
                super::UNKNOWN_ROUTE_ID.to_string(),
                "<unknown>",
                "<unknown>".to_string(),
            ),
        };

        let code = err.status(self.default_status);
        ctx.initial_span.record("error", true);
        ctx.initial_span.record("http.status_code", code.as_u16());

        if self.flags.debug {
            return Some(super::debug::debug_response(ctx, Some(err)));
        }

        let mut response = plain_status_response(code);
        if let Some(additional) = err.additional_header() {
            for (name, value) in additional {
                response.headers_mut().insert(name.clone(), value.clone());
            }
        }

        let elapsed = ctx.start_serve.elapsed();
        let remote = ctx.head.remote_host();
        let request_line = ctx.head.request_line();
        let flow_id = ctx.head.flow_id().unwrap_or("").to_string();
        let user_agent = ctx.head.user_agent().to_string();
        if code.as_u16() == 499 {
            tracing::info!(
                elapsed_ms = elapsed.as_millis() as u64,
                route = %route_id,
                backend_type,
                backend = %backend,
                flow_id = %flow_id,
                status = code.as_u16(),
                error = %err,
                remote = %remote,
                request = %request_line,
                user_agent = %user_agent,
                "client canceled"
            );
        } else {
            tracing::error!(
                elapsed_ms = elapsed.as_millis() as u64,
                route = %route_id,
                backend_type,
                backend = %backend,
                flow_id = %flow_id,
                status = code.as_u16(),
                error = %err,
                remote = %remote,
                request = %request_line,
                user_agent = %user_agent,
                "error while proxying"
            );
        }

        Some(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        let default = StatusCode::NOT_FOUND;
        assert_eq!(ProxyError::route_lookup_failed().status(default), default);
        assert_eq!(
            ProxyError::dial(std::io::Error::other("refused")).status(default),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::circuit_open().status(default),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyError::max_loopbacks().status(default),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(ProxyError::client_canceled().status(default).as_u16(), 499);
    }

    #[test]
    fn circuit_open_carries_header() {
        let err = ProxyError::circuit_open();
        let headers = err.additional_header().unwrap();
        assert_eq!(headers.get("x-circuit-open").unwrap(), "true");
    }

    #[test]
    fn plain_response_shape() {
        let rsp = plain_status_response(StatusCode::NOT_FOUND);
        assert_eq!(rsp.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            rsp.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
        assert_eq!(rsp.headers().get("x-content-type-options").unwrap(), "nosniff");
        assert_eq!(rsp.headers().get("server").unwrap(), "waygate");
    }
}
