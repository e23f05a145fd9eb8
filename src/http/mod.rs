//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, entry handler, initial span, access log)
//!     → request.rs (request head snapshot, host/remote helpers, path patch)
//!     → [pipeline engine runs filters and dispatches the backend]
//!     → response.rs (status finalisation, branded error pages, body tracking)
//!     → Send to client
//! ```

pub mod request;
pub mod response;
pub mod server;

pub use request::RequestHead;
