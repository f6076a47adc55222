//! Supervisor (systemd) integration.
//!
//! Only the client side of the notify protocol is implemented: readiness,
//! stopping, reloading, status text, main pid and watchdog pings.

pub mod notify;
pub mod watchdog;

pub use notify::{NotifyError, NotifyMessage, SupervisorNotifier};
pub use watchdog::spawn_watchdog;
