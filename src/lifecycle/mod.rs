//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Listener slots report in → Close unused inherited sockets → READY=1
//!
//! Shutdown (manager.rs):
//!     Request → Stop accepting servers → Drain → Terminate → Manager done
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Graceful shutdown
//!     SIGHUP → Restart (fork successor) or shutdown
//!     SIGUSR1 → Reopen logs, SIGUSR2 → Hammer
//! ```
//!
//! # Design Decisions
//! - Cancellation is a one-shot broadcast (cancel.rs), never re-armed
//! - States only move forward (state.rs)
//! - Shutdown has a deadline: the hammer abandons work after the grace period

pub mod cancel;
pub mod counter;
pub mod manager;
pub mod signals;
pub mod startup;
pub mod state;

pub use cancel::{CancelReason, CancelSignal, CancelWatcher};
pub use counter::{CompletionCounter, CompletionGuard};
pub use manager::{LifecycleError, Manager, ManagerOptions, ManagerStatus, ServerRegistration};
pub use signals::{HookTable, ProcessSignal, SignalDispatcher};
pub use startup::{spawn_startup_watcher, StartupOutcome};
pub use state::{LifecycleState, StateCell};
