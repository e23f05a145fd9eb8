//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All pipeline stages produce:
//!     → logging.rs (access log entries, log/no-log decision)
//!     → metrics.rs (counters and timers with contract names)
//!     → tracing.rs (span configuration, trace header passthrough)
//!
//! Consumers:
//!     → Log aggregation (stdout via tracing-subscriber)
//!     → Metrics endpoint (Prometheus scrape)
//!     → Distributed tracing (trace headers forwarded to backends)
//! ```
//!
//! # Design Decisions
//! - Metric names are part of the external contract, not labels
//! - The access log is a dedicated tracing target ("access")
//! - Metrics are cheap (atomic increments behind the facade)

pub mod logging;
pub mod metrics;
pub mod tracing;

pub use logging::{should_log, AccessEntry, AccessLogFilter};
pub use self::tracing::TraceConfig;
