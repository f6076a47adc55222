//! Managed servers: accept loops whose connections the lifecycle manager can
//! drain or abandon.

pub mod managed;

pub use managed::{ManagedServer, ServerError, ServerStatus};
