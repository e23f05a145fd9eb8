//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::proxy::{Flags, TransportOptions};
use crate::security::RatelimitSettings;

/// Root configuration for the proxy binary.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Control flags of the pipeline.
    pub flags: FlagsConfig,

    /// Route definitions mapping requests to backends.
    pub routes: Vec<RouteConfig>,

    /// Backend connection behaviour.
    pub transport: TransportConfig,

    /// Pipeline limits.
    pub limits: LimitsConfig,

    /// Global rate limiting configuration.
    pub rate_limit: RateLimitConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:9090").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Pipeline control flags.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct FlagsConfig {
    /// Skip verification of backend TLS certificates.
    pub insecure: bool,
    /// Keep an unmodified snapshot of the original request for filters.
    pub preserve_original: bool,
    /// Default the outbound Host header to the inbound one.
    pub preserve_host: bool,
    /// Run as a debug proxy.
    pub debug: bool,
    /// Remove hop-by-hop headers on outbound requests.
    pub hop_headers_removal: bool,
    /// Normalize reserved characters escaped in request paths.
    pub patch_path: bool,
}

impl FlagsConfig {
    pub fn to_flags(&self) -> Flags {
        Flags {
            insecure: self.insecure,
            preserve_original: self.preserve_original,
            preserve_host: self.preserve_host,
            debug: self.debug,
            hop_headers_removal: self.hop_headers_removal,
            patch_path: self.patch_path,
        }
    }
}

/// Route configuration mapping requests to a backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Route identifier for logging/metrics.
    pub name: String,

    /// Host header to match (exact match, port ignored).
    pub host: Option<String>,

    /// Path prefix to match.
    pub path_prefix: Option<String>,

    /// Route priority (higher = checked first).
    #[serde(default)]
    pub priority: u32,

    /// Per-route override of the global preserve-host flag.
    #[serde(default)]
    pub preserve_host: Option<bool>,

    /// Backend to dispatch to.
    pub backend: BackendConfig,
}

/// Backend of a configured route.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Fixed address, e.g. "http://10.0.0.1:8080".
    Static { address: String },
    /// Destination taken from the inbound request (and filter overrides).
    Dynamic,
    /// Endpoint chosen per request by a load balancing algorithm.
    LoadBalanced {
        endpoints: Vec<String>,
        #[serde(default = "default_algorithm")]
        algorithm: String,
    },
    /// Skip the backend and respond from the filter chain.
    Shunt,
    /// Re-enter the routing with the same request.
    Loopback,
}

fn default_algorithm() -> String {
    "roundRobin".to_string()
}

/// Backend connection behaviour.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// TCP connect timeout in seconds. Zero disables.
    pub connect_timeout_secs: u64,

    /// Budget for response headers in seconds.
    pub response_header_timeout_secs: u64,

    /// Idle pooled connection timeout and forced eviction period, seconds.
    pub idle_conn_timeout_secs: u64,

    /// Idle connections kept per backend host.
    pub max_idle_conns_per_host: usize,

    /// Open a fresh connection for every request.
    pub disable_keep_alives: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 5,
            response_header_timeout_secs: 60,
            idle_conn_timeout_secs: 20,
            max_idle_conns_per_host: crate::proxy::DEFAULT_IDLE_CONNS_PER_HOST,
            disable_keep_alives: false,
        }
    }
}

impl TransportConfig {
    pub fn to_options(&self, insecure: bool) -> TransportOptions {
        TransportOptions {
            connect_timeout: (self.connect_timeout_secs > 0)
                .then(|| Duration::from_secs(self.connect_timeout_secs)),
            response_header_timeout: Duration::from_secs(self.response_header_timeout_secs),
            idle_conn_timeout: Duration::from_secs(self.idle_conn_timeout_secs),
            max_idle_conns_per_host: self.max_idle_conns_per_host,
            disable_keep_alives: self.disable_keep_alives,
            insecure,
            ..Default::default()
        }
    }
}

/// Pipeline limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum number of allowed loops. Negative disables looping.
    pub max_loopbacks: Option<i32>,

    /// HTTP status used when no route matches.
    pub default_http_status: Option<u16>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_loopbacks: None,
            default_http_status: None,
        }
    }
}

/// Global rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable the global pre-routing rate limit.
    pub enabled: bool,

    /// Maximum requests per client within the window.
    pub max_hits: u32,

    /// Window length in seconds.
    pub time_window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_hits: 100,
            time_window_secs: 1,
        }
    }
}

impl RateLimitConfig {
    pub fn to_settings(&self) -> Option<RatelimitSettings> {
        self.enabled.then(|| RatelimitSettings {
            max_hits: self.max_hits,
            time_window: Duration::from_secs(self.time_window_secs),
        })
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,

    /// Disable the access log by default.
    pub access_log_disabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9911".to_string(),
            access_log_disabled: false,
        }
    }
}
