//! Process lifecycle manager.
//!
//! # Responsibilities
//! - Own the shutdown, hammer, terminate and manager-scope signals
//! - Drive `Init → Running → ShuttingDown → Terminate`
//! - Count running servers and terminate once they are all done
//! - Fork a successor on restart and stop the predecessor once a
//!   replacement listener is bound
//!
//! # Signal Ordering
//! ```text
//! shutdown ──(hammer grace | immediate hammer)──→ hammer
//!     └──(running servers reach zero + terminate delay)──→ terminate → manager
//! ```
//! Hammer never fires once terminate has happened.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;

use super::cancel::{CancelReason, CancelSignal};
use super::counter::{CompletionCounter, CompletionGuard};
use super::signals::HookTable;
use super::state::{LifecycleState, StateCell};
use crate::config::LifecycleSettings;
use crate::net::{ListenerInfo, ListenerRegistry};
use crate::observability::metrics;
use crate::process::restart::{signal_parent, ProcessRestarter, RestartError};
use crate::supervisor::{NotifyMessage, SupervisorNotifier};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("manager is shutting down, not accepting new servers")]
    ShuttingDown,
}

/// Tunables for a [`Manager`].
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Whether SIGHUP forks a successor instead of shutting down.
    pub restartable: bool,
    /// Delay between shutdown and hammer. `None` disables the hammer timer.
    pub hammer_grace: Option<Duration>,
    /// Pause between the last server finishing and terminate.
    pub terminate_delay: Duration,
    /// How long listeners may take to be requested at startup.
    pub startup_timeout: Option<Duration>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::from(&LifecycleSettings::default())
    }
}

impl From<&LifecycleSettings> for ManagerOptions {
    fn from(settings: &LifecycleSettings) -> Self {
        Self {
            restartable: settings.restartable,
            hammer_grace: u64::try_from(settings.hammer_grace_secs)
                .ok()
                .map(Duration::from_secs),
            terminate_delay: Duration::from_millis(settings.terminate_delay_ms),
            startup_timeout: (settings.startup_timeout_secs > 0)
                .then(|| Duration::from_secs(settings.startup_timeout_secs)),
        }
    }
}

type Hook = Box<dyn FnOnce() + Send>;
type TerminateHook = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

#[derive(Default)]
struct Hooks {
    shutdown: Vec<Hook>,
    hammer: Vec<Hook>,
    terminate: Vec<TerminateHook>,
}

/// Snapshot for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub pid: u32,
    pub state: LifecycleState,
    pub restartable: bool,
    pub forked: bool,
    pub running_servers: usize,
    pub pending_startup_slots: usize,
    pub provided_listeners: usize,
    pub active_listeners: Vec<ListenerInfo>,
}

/// Registration of one running server. Dropping it marks the server done.
#[derive(Debug)]
pub struct ServerRegistration {
    guard: CompletionGuard,
}

impl ServerRegistration {
    pub fn done(self) {
        self.guard.done();
    }
}

/// The lifecycle manager. Construct one per process and share the `Arc`.
///
/// Shutdown spawns its hammer and terminate timers onto the ambient Tokio
/// runtime, so the request methods must be called from within one.
pub struct Manager {
    options: ManagerOptions,
    state: StateCell,
    shutdown: OnceLock<CancelSignal>,
    hammer: OnceLock<CancelSignal>,
    terminate: OnceLock<CancelSignal>,
    scope: OnceLock<CancelSignal>,
    running: Arc<CompletionCounter>,
    registry: Arc<ListenerRegistry>,
    restarter: Arc<dyn ProcessRestarter>,
    notifier: SupervisorNotifier,
    forked: AtomicBool,
    parent_killed: AtomicBool,
    hooks: Mutex<Hooks>,
    hook_tables: RwLock<Vec<Arc<HookTable>>>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("state", &self.state.get())
            .field("options", &self.options)
            .field("running", &self.running.count())
            .finish_non_exhaustive()
    }
}

impl Manager {
    pub fn new(
        options: ManagerOptions,
        registry: Arc<ListenerRegistry>,
        restarter: Arc<dyn ProcessRestarter>,
        notifier: SupervisorNotifier,
    ) -> Arc<Self> {
        Arc::new(Self {
            options,
            state: StateCell::new(),
            shutdown: OnceLock::new(),
            hammer: OnceLock::new(),
            terminate: OnceLock::new(),
            scope: OnceLock::new(),
            running: Arc::new(CompletionCounter::new()),
            registry,
            restarter,
            notifier,
            forked: AtomicBool::new(false),
            parent_killed: AtomicBool::new(false),
            hooks: Mutex::new(Hooks::default()),
            hook_tables: RwLock::new(Vec::new()),
        })
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    pub fn state(&self) -> LifecycleState {
        self.state.get()
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    pub fn notifier(&self) -> &SupervisorNotifier {
        &self.notifier
    }

    pub fn is_restartable(&self) -> bool {
        self.options.restartable
    }

    /// Closed when graceful shutdown begins.
    pub fn shutdown_signal(&self) -> &CancelSignal {
        self.shutdown
            .get_or_init(|| CancelSignal::new(CancelReason::Shutdown))
    }

    /// Closed when in-flight work must be abandoned.
    pub fn hammer_signal(&self) -> &CancelSignal {
        self.hammer.get_or_init(|| CancelSignal::new(CancelReason::Hammer))
    }

    /// Closed right before the process exits.
    pub fn terminate_signal(&self) -> &CancelSignal {
        self.terminate
            .get_or_init(|| CancelSignal::new(CancelReason::Terminate))
    }

    /// Closed when the manager is finished (or its scope was cancelled).
    pub fn manager_signal(&self) -> &CancelSignal {
        self.scope.get_or_init(|| CancelSignal::new(CancelReason::Manager))
    }

    /// `Init → Running`. Returns `false` if the manager was already started.
    pub fn start(&self) -> bool {
        if !self.state.transition(LifecycleState::Init, LifecycleState::Running) {
            return false;
        }
        metrics::set_lifecycle_state(LifecycleState::Running);
        self.notifier
            .notify(NotifyMessage::Status("starting".to_string()));
        tracing::info!(pid = std::process::id(), "Lifecycle manager running");
        true
    }

    /// Announce one more running server.
    ///
    /// Also stops the parent process when this process is a handoff child
    /// with a replacement listener bound.
    pub fn register_server(&self) -> Result<ServerRegistration, LifecycleError> {
        let guard = self.running.guard().ok_or(LifecycleError::ShuttingDown)?;
        self.kill_parent();
        Ok(ServerRegistration { guard })
    }

    pub fn running_servers(&self) -> usize {
        self.running.count()
    }

    /// Send SIGTERM to the predecessor, at most once.
    ///
    /// No-op unless this process inherited its sockets (`LISTEN_FDS` set and
    /// parent pid > 1) and at least one replacement listener is bound.
    pub fn kill_parent(&self) {
        if !self.registry.has_active() {
            return;
        }
        let is_child = self
            .registry
            .manifest()
            .map(|m| m.is_handoff_child())
            .unwrap_or(false);
        if !is_child || self.parent_killed.swap(true, Ordering::AcqRel) {
            return;
        }
        match signal_parent() {
            Ok(Some(parent)) => tracing::info!(parent = parent.as_raw(), "Asked parent process to shut down"),
            Ok(None) => tracing::debug!("Parent already gone"),
            Err(e) => tracing::error!(error = %e, "Unable to signal parent process"),
        }
    }

    /// Begin graceful shutdown. No-op unless the manager is running.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn request_graceful_shutdown(self: &Arc<Self>) {
        if !self
            .state
            .transition(LifecycleState::Running, LifecycleState::ShuttingDown)
        {
            return;
        }
        tracing::info!(pid = std::process::id(), "Graceful shutdown started");
        metrics::set_lifecycle_state(LifecycleState::ShuttingDown);
        self.notifier.notify(NotifyMessage::Stopping);
        self.running.stop_accepting();
        self.shutdown_signal().close();

        let hooks = std::mem::take(&mut self.hooks.lock().shutdown);
        for hook in hooks {
            hook();
        }

        if let Some(grace) = self.options.hammer_grace {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                let terminate = manager.terminate_signal().watcher();
                tokio::select! {
                    _ = tokio::time::sleep(grace) => {
                        tracing::warn!(grace = ?grace, "Hammer grace elapsed");
                        manager.do_hammer();
                    }
                    _ = terminate.closed_owned() => {}
                }
            });
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.running.wait_for_zero().await;
            tracing::debug!("All servers done");
            if !manager.options.terminate_delay.is_zero() {
                tokio::time::sleep(manager.options.terminate_delay).await;
            }
            manager.do_terminate().await;
        });
    }

    /// Abandon in-flight work now.
    ///
    /// A running manager is moved into shutdown first so the shutdown signal
    /// always closes before the hammer signal. Needs a Tokio runtime for the
    /// same reason as [`request_graceful_shutdown`](Self::request_graceful_shutdown).
    pub fn request_immediate_hammer(self: &Arc<Self>) {
        if self.state() == LifecycleState::Running {
            self.request_graceful_shutdown();
        }
        self.do_hammer();
    }

    fn do_hammer(&self) {
        let closed = self.state.with_read(|state| {
            if state != LifecycleState::ShuttingDown {
                return false;
            }
            // The shutdown closer may still be between transition and close.
            self.shutdown_signal().close();
            self.hammer_signal().close()
        });
        if !closed {
            return;
        }
        tracing::warn!(pid = std::process::id(), "Hammering: abandoning in-flight work");
        let hooks = std::mem::take(&mut self.hooks.lock().hammer);
        for hook in hooks {
            hook();
        }
    }

    async fn do_terminate(&self) {
        if !self
            .state
            .transition(LifecycleState::ShuttingDown, LifecycleState::Terminate)
        {
            return;
        }
        tracing::info!(pid = std::process::id(), "Terminating");
        metrics::set_lifecycle_state(LifecycleState::Terminate);
        self.terminate_signal().close();

        let hooks = std::mem::take(&mut self.hooks.lock().terminate);
        futures_util::future::join_all(hooks.into_iter().map(|hook| hook())).await;

        self.manager_signal().close();
    }

    /// Cancel the whole process scope. Turned into a graceful shutdown.
    pub fn cancel_scope(self: &Arc<Self>) {
        if self.state() < LifecycleState::Terminate {
            tracing::warn!("Manager scope cancelled before shutdown finished, shutting down");
        }
        self.manager_signal().close();
        self.request_graceful_shutdown();
    }

    /// Fork a successor that inherits every active listener.
    pub fn request_restart(&self) -> Result<u32, RestartError> {
        if !self.restarter.is_supported() {
            return Err(RestartError::Disabled);
        }
        if self.forked.swap(true, Ordering::AcqRel) {
            return Err(RestartError::AlreadyForked);
        }

        self.notifier.notify(NotifyMessage::Reloading);
        let result = self
            .registry
            .manifest()
            .map_err(RestartError::from)
            .and_then(|manifest| {
                self.restarter
                    .spawn_successor(&self.registry.active(), &manifest)
            });

        match &result {
            Ok(pid) => {
                metrics::record_restart("success");
                self.notifier
                    .notify(NotifyMessage::Status(format!("handing over to pid {pid}")));
            }
            Err(e) => {
                // Leave room for another attempt.
                self.forked.store(false, Ordering::Release);
                metrics::record_restart("failure");
                tracing::error!(error = %e, "Restart failed, continuing to serve");
                self.notifier.notify(NotifyMessage::Ready);
            }
        }
        result
    }

    /// Run `hook` when shutdown begins, or now if it already has.
    pub fn run_at_shutdown(&self, hook: impl FnOnce() + Send + 'static) {
        let mut hooks = self.hooks.lock();
        if self.shutdown_signal().is_closed() {
            drop(hooks);
            hook();
            return;
        }
        hooks.shutdown.push(Box::new(hook));
    }

    /// Run `hook` when the hammer fires, or now if it already has.
    pub fn run_at_hammer(&self, hook: impl FnOnce() + Send + 'static) {
        let mut hooks = self.hooks.lock();
        if self.hammer_signal().is_closed() {
            drop(hooks);
            hook();
            return;
        }
        hooks.hammer.push(Box::new(hook));
    }

    /// Await `hook` during terminate, before the manager signal closes.
    ///
    /// Hooks registered after terminate has started are spawned instead.
    pub fn run_at_terminate<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut hooks = self.hooks.lock();
        if self.terminate_signal().is_closed() {
            drop(hooks);
            tokio::spawn(hook());
            return;
        }
        hooks.terminate.push(Box::new(move || Box::pin(hook())));
    }

    /// Attach a server's signal hooks to the dispatcher.
    pub fn attach_hooks(&self, table: Arc<HookTable>) {
        self.hook_tables.write().push(table);
    }

    pub fn detach_hooks(&self, table: &Arc<HookTable>) {
        self.hook_tables.write().retain(|t| !Arc::ptr_eq(t, table));
    }

    pub(crate) fn hook_tables(&self) -> Vec<Arc<HookTable>> {
        self.hook_tables.read().clone()
    }

    /// Wait until the manager is finished.
    pub async fn done(&self) {
        self.manager_signal().closed().await
    }

    pub fn status(&self) -> ManagerStatus {
        ManagerStatus {
            pid: std::process::id(),
            state: self.state(),
            restartable: self.options.restartable,
            forked: self.forked.load(Ordering::Acquire),
            running_servers: self.running.count(),
            pending_startup_slots: self.registry.pending_slots(),
            provided_listeners: self.registry.provided_count(),
            active_listeners: self.registry.active_info(),
        }
    }
}
