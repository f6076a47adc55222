//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! LISTEN_FDS inherited sockets ─┐
//!                               ├→ registry.rs (match by address, or bind fresh)
//! (network, address) request ───┘
//!     → listener.rs (counted accept, closable)
//!     → tls.rs (optional TLS handshake)
//!     → connection.rs (completion guard per connection)
//!     → Hand off to the accept loop
//! ```
//!
//! # Design Decisions
//! - A record is handed out once; duplicates go to the accept loop
//! - Every accepted connection is counted so hammer can drain it
//! - TLS is optional and handled per connection task

pub mod addr;
pub mod connection;
pub mod listener;
pub mod registry;
pub mod tls;

pub use addr::{ListenAddr, Network, NetworkClass};
pub use connection::{ConnectionId, ManagedStream};
pub use listener::{is_listener_closed, ListenerKind, ManagedListener, PeerAddr};
pub use registry::{ListenerError, ListenerInfo, ListenerRecord, ListenerRegistry};
pub use tls::TlsListener;
