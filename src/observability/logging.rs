//! Access logging.
//!
//! # Responsibilities
//! - Emit one structured entry per served request on the `access` target
//! - Decide per request whether to log, from the state-bag filter or the
//!   global setting

use std::time::Duration;

/// Per-request access log control, pushed into the state bag by filters.
///
/// `prefixes` narrows the decision to status code classes: a single digit
/// matches the century (2 ⇔ 200–299), two digits the decade (50 ⇔
/// 500–509), three digits one exact status. With no prefixes the `enable`
/// flag decides unconditionally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessLogFilter {
    pub enable: bool,
    pub prefixes: Vec<u32>,
}

impl AccessLogFilter {
    pub fn enabled() -> Self {
        Self {
            enable: true,
            prefixes: Vec::new(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enable: false,
            prefixes: Vec::new(),
        }
    }
}

/// Whether a response with this status should be logged under the filter.
///
/// A status matching any prefix combined with `enable = false` suppresses
/// the entry, so a disable filter with prefixes acts as an allow-exclude.
pub fn should_log(status: u16, filter: &AccessLogFilter) -> bool {
    if filter.prefixes.is_empty() {
        return filter.enable;
    }
    let status = u32::from(status);
    let mut matched = false;
    for &prefix in &filter.prefixes {
        matched = match prefix {
            p if p < 10 => status >= p * 100 && status < (p + 1) * 100,
            p if p < 100 => status >= p * 10 && status < (p + 1) * 10,
            p => status == p,
        };
        if matched {
            break;
        }
    }
    matched == filter.enable
}

/// One served request, as recorded by the entry handler.
#[derive(Debug)]
pub struct AccessEntry {
    pub method: http::Method,
    pub path: String,
    pub proto: &'static str,
    pub status: u16,
    pub response_size: u64,
    pub remote_host: String,
    pub duration: Duration,
    pub flow_id: Option<String>,
    pub user_agent: String,
    /// Extra fields pushed by filters through the state bag.
    pub additional: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Emit the entry on the dedicated access target.
pub fn log_access(entry: &AccessEntry) {
    tracing::info!(
        target: "access",
        method = %entry.method,
        path = %entry.path,
        proto = entry.proto,
        status = entry.status,
        response_size = entry.response_size,
        remote = %entry.remote_host,
        duration_ms = entry.duration.as_millis() as u64,
        flow_id = entry.flow_id.as_deref().unwrap_or(""),
        user_agent = %entry.user_agent,
        additional = %entry
            .additional
            .as_ref()
            .map(|m| serde_json::Value::Object(m.clone()).to_string())
            .unwrap_or_default(),
        "access"
    );
}
