//! Traffic protection subsystem.
//!
//! # Data Flow
//! ```text
//! Inbound request (root of the pipeline)
//!     → rate_limit.rs global check (per client IP)
//! Outbound request (after mapping)
//!     → rate_limit.rs backend check (per scheme://host)
//! ```
//!
//! # Design Decisions
//! - Token buckets per key; buckets created lazily
//! - Rejections carry the limit headers so clients can back off
//! - Backend rejections synthesize a response, no backend call is made

pub mod rate_limit;

pub use rate_limit::{
    BackendRatelimit, RatelimitExceeded, RatelimitRegistry, RatelimitSettings,
};
