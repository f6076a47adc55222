//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events, stderr or a reopenable file)
//!     → metrics.rs (connection, signal, restart and state metrics)
//!
//! Consumers:
//!     → Log aggregation (stderr, file)
//!     → Metrics endpoint (Prometheus scrape)
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFile, LogHandle, LoggingError};
