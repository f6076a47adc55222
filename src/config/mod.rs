//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → HandoffConfig (validated, immutable)
//!     → lifecycle, listener and server settings handed to each subsystem
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; a restart picks up a new file
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AdminConfig, HandoffConfig, LifecycleSettings, ListenerSettings, LogFormat,
    ObservabilityConfig, ServerConfig, TlsConfig,
};
pub use validation::{validate_config, ValidationError};
