//! Pooled backend transport.
//!
//! # Responsibilities
//! - Reuse connections per (scheme, host) with bounded idle pools
//! - Forcibly evict idle connections on a fixed period
//! - Tag connect-phase failures so the engine can retry them safely
//! - Dispatch through an HTTP proxy when the outbound request asks for it

use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use http::{Request, Response, StatusCode, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::lifecycle::Shutdown;
use crate::proxy::error::ProxyError;

/// The default number of idle connections kept per backend host.
pub const DEFAULT_IDLE_CONNS_PER_HOST: usize = 64;

/// The default period at which idle connections are forcibly closed.
pub const DEFAULT_CLOSE_IDLE_CONNS_PERIOD: Duration = Duration::from_secs(20);

/// The default timeout waiting for response headers from a backend.
pub const DEFAULT_RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(60);

/// The default timeout waiting for a response to a 100 Continue request.
pub const DEFAULT_EXPECT_CONTINUE_TIMEOUT: Duration = Duration::from_secs(30);

/// Backend connection behaviour of a proxy instance.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// TCP connect timeout to the backend.
    pub connect_timeout: Option<Duration>,
    /// TCP keepalive interval for backend connections.
    pub keep_alive: Option<Duration>,
    /// TLS handshake budget; counted within the connect phase.
    pub tls_handshake_timeout: Option<Duration>,
    /// Budget for the backend to produce response headers.
    pub response_header_timeout: Duration,
    /// Budget to expect a response for a 100 Continue request.
    pub expect_continue_timeout: Duration,
    /// Idle connections kept per backend host.
    pub max_idle_conns_per_host: usize,
    /// Idle timeout of pooled connections, and the forced eviction period.
    /// Zero disables the eviction task.
    pub idle_conn_timeout: Duration,
    /// Open a fresh connection for every request.
    pub disable_keep_alives: bool,
    /// Skip verification of backend TLS certificates.
    pub insecure: bool,
    /// TLS configuration for backend connections. Overrides `insecure`.
    pub client_tls: Option<native_tls::TlsConnector>,
    /// Allow both address families when dialing.
    pub dual_stack: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: None,
            keep_alive: None,
            tls_handshake_timeout: None,
            response_header_timeout: DEFAULT_RESPONSE_HEADER_TIMEOUT,
            expect_continue_timeout: DEFAULT_EXPECT_CONTINUE_TIMEOUT,
            max_idle_conns_per_host: DEFAULT_IDLE_CONNS_PER_HOST,
            idle_conn_timeout: DEFAULT_CLOSE_IDLE_CONNS_PERIOD,
            disable_keep_alives: false,
            insecure: false,
            client_tls: None,
            dual_stack: true,
        }
    }
}

/// Outbound request descriptor handed to a transport.
pub struct OutboundRequest {
    pub request: Request<Body>,
    /// When set, the transport dials this HTTP proxy and sends the request
    /// in absolute form instead of contacting the request URI's host.
    pub proxy: Option<Uri>,
    /// Peer address of the inbound connection, for transports that pass it
    /// to the backend process (FastCGI).
    pub remote_addr: Option<SocketAddr>,
    /// Script name for FastCGI backends, from the state bag.
    pub fastcgi_filename: Option<String>,
}

/// One backend round trip. The pooled client implements this; FastCGI and
/// test transports plug in through the same seam.
#[async_trait]
pub trait BackendTransport: Send + Sync {
    async fn round_trip(&self, outbound: OutboundRequest) -> Result<Response<Body>, ProxyError>;
}

type PoolClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Connection-pooling transport over the hyper client.
pub struct PooledTransport {
    options: TransportOptions,
    client: RwLock<PoolClient>,
}

impl PooledTransport {
    pub fn new(options: TransportOptions) -> Self {
        let client = Self::build_client(&options);
        Self {
            options,
            client: RwLock::new(client),
        }
    }

    fn build_client(options: &TransportOptions) -> PoolClient {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(options.connect_timeout);
        http.set_keepalive(options.keep_alive);
        http.set_nodelay(true);
        if !options.dual_stack {
            http.set_happy_eyeballs_timeout(None);
        }

        let tls = match &options.client_tls {
            Some(tls) => tls.clone(),
            None => native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(options.insecure)
                .build()
                .expect("failed to build backend TLS connector"),
        };
        let https = HttpsConnector::from((http, tls.into()));

        let max_idle = if options.disable_keep_alives {
            0
        } else {
            options.max_idle_conns_per_host
        };

        let mut builder = Client::builder(TokioExecutor::new());
        builder
            .pool_max_idle_per_host(max_idle)
            .pool_timer(TokioTimer::new());
        if !options.idle_conn_timeout.is_zero() {
            builder.pool_idle_timeout(options.idle_conn_timeout);
        }
        builder.build(https)
    }

    /// Start the forced idle eviction task. The per-connection idle timer
    /// alone does not guarantee turnover on DNS change, so the whole pool
    /// is swapped every period; connections in flight drain on the old one.
    pub fn spawn_idle_eviction(self: &Arc<Self>, shutdown: &Shutdown) {
        let period = self.options.idle_conn_timeout;
        if period.is_zero() {
            return;
        }
        let transport = self.clone();
        let mut quit = shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // First tick completes immediately; skip it.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let fresh = Self::build_client(&transport.options);
                        *transport.client.write().expect("transport pool lock") = fresh;
                        tracing::debug!("closed idle backend connections");
                    }
                    _ = quit.recv() => return,
                }
            }
        });
    }

    /// Send the request through the configured HTTP proxy on a dedicated
    /// connection, keeping the absolute-form request target.
    async fn round_trip_via_proxy(
        &self,
        proxy: Uri,
        request: Request<Body>,
    ) -> Result<Response<Body>, ProxyError> {
        let authority = proxy
            .authority()
            .ok_or_else(|| ProxyError::map(io_err("proxy URL without authority")))?;
        let port = authority.port_u16().unwrap_or(80);
        let addr = (authority.host().to_string(), port);

        tracing::debug!(proxy = %authority, dial_context = "start");
        let connect = TcpStream::connect(addr);
        let stream = match self.options.connect_timeout {
            Some(t) => timeout(t, connect)
                .await
                .map_err(|_| ProxyError::dial(io_err("connect timeout")))?,
            None => connect.await,
        }
        .map_err(ProxyError::dial)?;
        tracing::debug!(proxy = %authority, dial_context = "done");

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(ProxyError::dial)?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                tracing::debug!(error = %err, "proxied backend connection ended");
            }
        });

        let response = timeout(
            self.options.response_header_timeout,
            sender.send_request(request),
        )
        .await
        .map_err(|_| response_header_timeout_error())?
        .map_err(classify_hyper_error)?;

        Ok(response.map(Body::new))
    }
}

#[async_trait]
impl BackendTransport for PooledTransport {
    async fn round_trip(&self, outbound: OutboundRequest) -> Result<Response<Body>, ProxyError> {
        if let Some(proxy) = outbound.proxy {
            return self.round_trip_via_proxy(proxy, outbound.request).await;
        }

        let client = self.client.read().expect("transport pool lock").clone();
        // The round trip resolves when response headers arrive, so this
        // budget is the response header timeout. A dial that only lands
        // after the budget elapsed surfaces as 504 here as well.
        match timeout(
            self.options.response_header_timeout,
            client.request(outbound.request),
        )
        .await
        {
            Err(_) => Err(response_header_timeout_error()),
            Ok(Ok(response)) => Ok(response.map(Body::new)),
            Ok(Err(err)) => Err(classify_client_error(err)),
        }
    }
}

fn response_header_timeout_error() -> ProxyError {
    ProxyError::with_code(
        StatusCode::GATEWAY_TIMEOUT,
        io_err("timeout awaiting response headers"),
    )
}

/// Map a pooled client failure onto the pipeline error taxonomy.
fn classify_client_error(err: hyper_util::client::legacy::Error) -> ProxyError {
    if err.is_connect() {
        return ProxyError::dial(err);
    }
    classify_source_chain(err)
}

fn classify_hyper_error(err: hyper::Error) -> ProxyError {
    if err.is_canceled() {
        return ProxyError::client_canceled();
    }
    classify_source_chain(err)
}

enum FailureClass {
    Canceled,
    Timeout,
    Network,
    Other,
}

fn failure_class(err: &(dyn StdError + 'static)) -> FailureClass {
    let mut cursor: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(current) = cursor {
        if let Some(hyper_err) = current.downcast_ref::<hyper::Error>() {
            if hyper_err.is_canceled() {
                return FailureClass::Canceled;
            }
        }
        if let Some(io_error) = current.downcast_ref::<std::io::Error>() {
            return match io_error.kind() {
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                    FailureClass::Timeout
                }
                _ => FailureClass::Network,
            };
        }
        cursor = current.source();
    }
    FailureClass::Other
}

fn classify_source_chain(err: impl StdError + Send + Sync + 'static) -> ProxyError {
    match failure_class(&err) {
        FailureClass::Canceled => ProxyError::client_canceled(),
        FailureClass::Timeout => ProxyError::with_code(StatusCode::GATEWAY_TIMEOUT, err),
        FailureClass::Network => ProxyError::with_code(StatusCode::SERVICE_UNAVAILABLE, err),
        FailureClass::Other => ProxyError::backend(err),
    }
}

fn io_err(msg: &'static str) -> std::io::Error {
    std::io::Error::other(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_timeout_maps_to_gateway_timeout() {
        let err = std::io::Error::new(std::io::ErrorKind::TimedOut, "read timeout");
        let perr = classify_source_chain(err);
        assert_eq!(perr.code(), Some(StatusCode::GATEWAY_TIMEOUT));
    }

    #[test]
    fn io_reset_maps_to_service_unavailable() {
        let err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let perr = classify_source_chain(err);
        assert_eq!(perr.code(), Some(StatusCode::SERVICE_UNAVAILABLE));
    }

    #[test]
    fn unknown_errors_default_to_internal() {
        let perr = classify_source_chain(std::fmt::Error);
        assert_eq!(
            perr.status(StatusCode::NOT_FOUND),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
