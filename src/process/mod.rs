//! Process-boundary plumbing.
//!
//! # Data Flow
//! ```text
//! startup:  environment → env.rs (EnvManifest) → net::registry adopts fds
//! restart:  active listeners + EnvManifest → restart.rs → successor process
//! takeover: successor binds a listener → restart::signal_parent → SIGTERM
//! ```

pub mod env;
pub mod restart;

pub use env::{EnvManifest, InheritedFd, ManifestError};
pub use restart::{DisabledRestarter, ExecRestarter, ProcessRestarter, RestartError};
