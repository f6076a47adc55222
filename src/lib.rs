//! Process lifecycle and socket handoff library.
//!
//! Graceful shutdown, hammer deadlines and zero-downtime restarts for
//! long-running servers: listening sockets are passed to a successor
//! process through `LISTEN_FDS`, and the successor retires its parent once it
//! serves on them.

pub mod admin;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod process;
pub mod server;
pub mod supervisor;

pub use config::schema::HandoffConfig;
pub use lifecycle::{LifecycleState, Manager, ManagerOptions};
pub use net::ListenerRegistry;
pub use server::ManagedServer;
