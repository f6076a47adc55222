//! OS signal handling.
//!
//! # Responsibilities
//! - Register handlers for SIGHUP, SIGUSR1, SIGUSR2, SIGINT, SIGTERM, SIGTSTP
//! - Translate each signal into a manager action
//! - Run per-server pre and post hooks around every action
//!
//! # Signal Table
//! ```text
//! SIGHUP   restartable: fork successor (already forked → immediate hammer)
//!          otherwise:   graceful shutdown
//! SIGUSR1  reopen log files
//! SIGUSR2  immediate hammer
//! SIGINT   graceful shutdown
//! SIGTERM  graceful shutdown
//! SIGTSTP  ignored
//! ```
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - One signal at a time: hooks and action finish before the next is read
//! - Manager-scope cancellation ends the dispatcher after a graceful shutdown

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::task::JoinHandle;

use super::manager::Manager;
use crate::observability::logging::LogHandle;
use crate::observability::metrics;
use crate::process::restart::RestartError;

/// Signals the dispatcher reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessSignal {
    Hangup,
    User1,
    User2,
    Interrupt,
    Terminate,
    Stop,
}

impl ProcessSignal {
    pub const ALL: [ProcessSignal; 6] = [
        ProcessSignal::Hangup,
        ProcessSignal::User1,
        ProcessSignal::User2,
        ProcessSignal::Interrupt,
        ProcessSignal::Terminate,
        ProcessSignal::Stop,
    ];

    pub fn kind(self) -> SignalKind {
        match self {
            ProcessSignal::Hangup => SignalKind::hangup(),
            ProcessSignal::User1 => SignalKind::user_defined1(),
            ProcessSignal::User2 => SignalKind::user_defined2(),
            ProcessSignal::Interrupt => SignalKind::interrupt(),
            ProcessSignal::Terminate => SignalKind::terminate(),
            ProcessSignal::Stop => SignalKind::from_raw(nix::libc::SIGTSTP),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessSignal::Hangup => "SIGHUP",
            ProcessSignal::User1 => "SIGUSR1",
            ProcessSignal::User2 => "SIGUSR2",
            ProcessSignal::Interrupt => "SIGINT",
            ProcessSignal::Terminate => "SIGTERM",
            ProcessSignal::Stop => "SIGTSTP",
        }
    }
}

impl fmt::Display for ProcessSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callback run around a signal's action.
pub type SignalHook = Arc<dyn Fn(ProcessSignal) + Send + Sync>;

/// Ordered pre- and post-signal callbacks of one server.
#[derive(Default)]
pub struct HookTable {
    pre: RwLock<HashMap<ProcessSignal, Vec<SignalHook>>>,
    post: RwLock<HashMap<ProcessSignal, Vec<SignalHook>>>,
}

impl fmt::Debug for HookTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookTable")
            .field("pre", &self.pre.read().keys().collect::<Vec<_>>())
            .field("post", &self.post.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pre(&self, signal: ProcessSignal, hook: impl Fn(ProcessSignal) + Send + Sync + 'static) {
        self.pre.write().entry(signal).or_default().push(Arc::new(hook));
    }

    pub fn add_post(&self, signal: ProcessSignal, hook: impl Fn(ProcessSignal) + Send + Sync + 'static) {
        self.post.write().entry(signal).or_default().push(Arc::new(hook));
    }

    pub fn run_pre(&self, signal: ProcessSignal) {
        run_hooks(&self.pre, signal);
    }

    pub fn run_post(&self, signal: ProcessSignal) {
        run_hooks(&self.post, signal);
    }
}

fn run_hooks(table: &RwLock<HashMap<ProcessSignal, Vec<SignalHook>>>, signal: ProcessSignal) {
    // Clone out so hooks may register more hooks.
    let hooks = table.read().get(&signal).cloned().unwrap_or_default();
    for hook in hooks {
        hook(signal);
    }
}

/// Maps OS signals onto a [`Manager`].
#[derive(Debug, Clone)]
pub struct SignalDispatcher {
    manager: Arc<Manager>,
    logs: Option<LogHandle>,
}

impl SignalDispatcher {
    pub fn new(manager: Arc<Manager>, logs: Option<LogHandle>) -> Self {
        Self { manager, logs }
    }

    /// Install the OS handlers and process signals on a background task.
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        let mut streams = Vec::with_capacity(ProcessSignal::ALL.len());
        for sig in ProcessSignal::ALL {
            streams.push((sig, signal(sig.kind())?));
        }
        Ok(tokio::spawn(self.run(streams)))
    }

    async fn run(self, mut streams: Vec<(ProcessSignal, Signal)>) {
        let mut scope = self.manager.manager_signal().watcher();
        loop {
            let received = tokio::select! {
                _ = scope.closed() => None,
                sig = next_signal(&mut streams) => sig,
            };
            let Some(sig) = received else {
                // Streams never end while the runtime lives; treat it like cancellation.
                self.manager.request_graceful_shutdown();
                break;
            };
            self.dispatch(sig);
        }
        tracing::debug!("Signal dispatcher stopped");
    }

    /// Handle one signal: pre hooks, action, post hooks.
    pub fn dispatch(&self, sig: ProcessSignal) {
        let pid = std::process::id();
        metrics::record_signal(sig.as_str());
        let tables = self.manager.hook_tables();
        for table in &tables {
            table.run_pre(sig);
        }

        match sig {
            ProcessSignal::Hangup if self.manager.is_restartable() => {
                tracing::info!(pid, signal = %sig, "Attempting graceful restart");
                match self.manager.request_restart() {
                    Ok(child) => tracing::info!(pid, child, "Successor started"),
                    Err(RestartError::AlreadyForked) => {
                        tracing::warn!(pid, "Already forked, hammering");
                        self.manager.request_immediate_hammer();
                    }
                    Err(e) => tracing::error!(pid, error = %e, "Graceful restart failed"),
                }
            }
            ProcessSignal::Hangup | ProcessSignal::Interrupt | ProcessSignal::Terminate => {
                tracing::info!(pid, signal = %sig, "Shutting down");
                self.manager.request_graceful_shutdown();
            }
            ProcessSignal::User1 => {
                tracing::info!(pid, signal = %sig, "Reopening logs");
                if let Some(logs) = &self.logs {
                    if let Err(e) = logs.reopen() {
                        tracing::error!(pid, error = %e, "Unable to reopen logs");
                    }
                }
            }
            ProcessSignal::User2 => {
                tracing::warn!(pid, signal = %sig, "Hammering");
                self.manager.request_immediate_hammer();
            }
            ProcessSignal::Stop => tracing::info!(pid, signal = %sig, "Ignoring"),
        }

        for table in &tables {
            table.run_post(sig);
        }
    }
}

async fn next_signal(streams: &mut [(ProcessSignal, Signal)]) -> Option<ProcessSignal> {
    let pending = streams.iter_mut().map(|(sig, stream)| {
        let sig = *sig;
        Box::pin(async move { stream.recv().await.map(|()| sig) })
    });
    let (received, _, _) = futures_util::future::select_all(pending).await;
    received
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenerSettings;
    use crate::lifecycle::manager::ManagerOptions;
    use crate::lifecycle::state::LifecycleState;
    use crate::net::ListenerRegistry;
    use crate::process::env::EnvManifest;
    use crate::process::restart::DisabledRestarter;
    use crate::supervisor::SupervisorNotifier;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn manager(restartable: bool) -> Arc<Manager> {
        let registry = Arc::new(ListenerRegistry::with_manifest(
            ListenerSettings::default(),
            0,
            EnvManifest::default(),
        ));
        let manager = Manager::new(
            ManagerOptions {
                restartable,
                hammer_grace: None,
                terminate_delay: Duration::ZERO,
                startup_timeout: None,
            },
            registry,
            Arc::new(DisabledRestarter),
            SupervisorNotifier::disabled(),
        );
        manager.start();
        manager
    }

    #[tokio::test]
    async fn hooks_wrap_the_action() {
        let manager = manager(false);
        let _registration = manager.register_server().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let table = Arc::new(HookTable::new());
        {
            let seen = seen.clone();
            let manager = manager.clone();
            table.add_pre(ProcessSignal::Terminate, move |sig| {
                assert_eq!(manager.state(), LifecycleState::Running);
                seen.lock().push(format!("pre {sig}"));
            });
        }
        {
            let seen = seen.clone();
            let manager = manager.clone();
            table.add_post(ProcessSignal::Terminate, move |sig| {
                assert_eq!(manager.state(), LifecycleState::ShuttingDown);
                seen.lock().push(format!("post {sig}"));
            });
        }
        manager.attach_hooks(table.clone());

        let dispatcher = SignalDispatcher::new(manager.clone(), None);
        dispatcher.dispatch(ProcessSignal::Terminate);
        assert_eq!(*seen.lock(), vec!["pre SIGTERM", "post SIGTERM"]);

        manager.detach_hooks(&table);
        dispatcher.dispatch(ProcessSignal::Terminate);
        assert_eq!(seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn hangup_without_restart_shuts_down() {
        let manager = manager(false);
        let _registration = manager.register_server().unwrap();
        SignalDispatcher::new(manager.clone(), None).dispatch(ProcessSignal::Hangup);
        assert_eq!(manager.state(), LifecycleState::ShuttingDown);
    }

    #[tokio::test]
    async fn failed_restart_keeps_running() {
        let manager = manager(true);
        SignalDispatcher::new(manager.clone(), None).dispatch(ProcessSignal::Hangup);
        assert_eq!(manager.state(), LifecycleState::Running);
        assert!(!manager.shutdown_signal().is_closed());
    }

    #[tokio::test]
    async fn user2_hammers_and_tstp_is_ignored() {
        let manager = manager(false);
        let _registration = manager.register_server().unwrap();
        let dispatcher = SignalDispatcher::new(manager.clone(), None);

        dispatcher.dispatch(ProcessSignal::Stop);
        assert_eq!(manager.state(), LifecycleState::Running);

        dispatcher.dispatch(ProcessSignal::User2);
        assert!(manager.shutdown_signal().is_closed());
        assert!(manager.hammer_signal().is_closed());
    }

    #[tokio::test]
    async fn dispatcher_exits_on_scope_cancel() {
        let manager = manager(false);
        let handle = SignalDispatcher::new(manager.clone(), None).spawn().unwrap();
        manager.cancel_scope();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("dispatcher should stop")
            .unwrap();
        assert!(manager.shutdown_signal().is_closed());
    }
}
