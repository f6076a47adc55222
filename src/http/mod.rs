//! HTTP demo service.
//!
//! # Data Flow
//! ```text
//! ManagedListener / TlsListener
//!     → server.rs (accept loop, one hyper-util connection task each)
//!     → request.rs (x-request-id assigned and echoed)
//!     → axum router (demo or admin handlers)
//!     → Send to client
//! ```

pub mod request;
pub mod server;

pub use request::{request_id, with_request_id, X_REQUEST_ID};
pub use server::{app_router, serve_http, serve_https, Greeting};
