//! Managed server wrapper.
//!
//! # Lifecycle
//! ```text
//! listen_and_serve
//!     → registry.get_listener (inherited or fresh) → kill parent
//!     → Running: register with manager, run the caller's accept loop
//! manager shutdown → do_shutdown
//!     → ShuttingDown: close listener, release record
//!     → accept loop returns → counter stops accepting
//!     → in-flight connections drain
//! manager hammer → do_hammer
//!     → shut down first if still running
//!     → force the connection counter to zero
//! counter at zero → Terminate → server done
//! ```

use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::lifecycle::cancel::{CancelReason, CancelSignal, CancelWatcher};
use crate::lifecycle::counter::CompletionCounter;
use crate::lifecycle::manager::{LifecycleError, Manager};
use crate::lifecycle::signals::{HookTable, ProcessSignal};
use crate::lifecycle::state::{LifecycleState, StateCell};
use crate::net::listener::{is_listener_closed, ListenerKind, ManagedListener};
use crate::net::tls::{load_tls_config, TlsListener};
use crate::net::{ListenerError, ListenerRecord};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("unable to prepare listener: {0}")]
    Io(#[from] io::Error),

    #[error("unable to load TLS material: {0}")]
    Tls(#[source] io::Error),

    #[error("accept loop failed: {0}")]
    Serve(#[source] io::Error),

    #[error("server {0} already started")]
    AlreadyStarted(String),
}

/// Serializable summary of a server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub network: String,
    pub address: String,
    pub state: LifecycleState,
    pub connections: usize,
}

/// A server whose connections are tracked by the lifecycle manager.
pub struct ManagedServer {
    name: Arc<str>,
    network: String,
    address: String,
    manager: Arc<Manager>,
    state: StateCell,
    connections: Arc<CompletionCounter>,
    closed: CancelSignal,
    record: Mutex<Option<Arc<ListenerRecord>>>,
    hooks: Arc<HookTable>,
    keepalive: Option<Duration>,
    on_shutdown: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl std::fmt::Debug for ManagedServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedServer")
            .field("name", &self.name)
            .field("network", &self.network)
            .field("address", &self.address)
            .field("state", &self.state.get())
            .field("connections", &self.connections.count())
            .finish_non_exhaustive()
    }
}

impl ManagedServer {
    pub fn new(
        manager: Arc<Manager>,
        name: impl Into<String>,
        network: impl Into<String>,
        address: impl Into<String>,
    ) -> Arc<Self> {
        Self::with_keepalive(manager, name, network, address, Some(Duration::from_secs(180)))
    }

    /// Same as [`new`](Self::new) with a custom TCP keep-alive period.
    pub fn with_keepalive(
        manager: Arc<Manager>,
        name: impl Into<String>,
        network: impl Into<String>,
        address: impl Into<String>,
        keepalive: Option<Duration>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: Arc::from(name.into()),
            network: network.into(),
            address: address.into(),
            manager,
            state: StateCell::new(),
            connections: Arc::new(CompletionCounter::new()),
            closed: CancelSignal::new(CancelReason::Shutdown),
            record: Mutex::new(None),
            hooks: Arc::new(HookTable::new()),
            keepalive,
            on_shutdown: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LifecycleState {
        self.state.get()
    }

    pub fn connections(&self) -> usize {
        self.connections.count()
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    /// Closed when this server stops accepting. Accept loops use it to wind
    /// down idle keep-alive connections.
    pub fn shutdown_watcher(&self) -> CancelWatcher {
        self.closed.watcher()
    }

    /// Closed when in-flight connections should be abandoned.
    pub fn hammer_watcher(&self) -> CancelWatcher {
        self.manager.hammer_signal().watcher()
    }

    /// Callback run once when the server starts shutting down.
    pub fn set_on_shutdown(&self, callback: impl FnOnce() + Send + 'static) {
        *self.on_shutdown.lock() = Some(Box::new(callback));
    }

    pub fn add_pre_signal_hook(
        &self,
        signal: ProcessSignal,
        hook: impl Fn(ProcessSignal) + Send + Sync + 'static,
    ) {
        self.hooks.add_pre(signal, hook);
    }

    pub fn add_post_signal_hook(
        &self,
        signal: ProcessSignal,
        hook: impl Fn(ProcessSignal) + Send + Sync + 'static,
    ) {
        self.hooks.add_post(signal, hook);
    }

    /// Obtain the listener and run `accept_loop` on it until shutdown.
    ///
    /// A listener-closed error from the loop is a normal return.
    pub async fn listen_and_serve<F, Fut>(self: &Arc<Self>, accept_loop: F) -> Result<(), ServerError>
    where
        F: FnOnce(ManagedListener) -> Fut,
        Fut: Future<Output = io::Result<()>>,
    {
        let listener = self.prepare()?;
        self.serve(accept_loop(listener)).await
    }

    /// Like [`listen_and_serve`](Self::listen_and_serve), with TLS.
    pub async fn listen_and_serve_tls<F, Fut>(
        self: &Arc<Self>,
        cert: &Path,
        key: &Path,
        accept_loop: F,
    ) -> Result<(), ServerError>
    where
        F: FnOnce(TlsListener) -> Fut,
        Fut: Future<Output = io::Result<()>>,
    {
        let config = load_tls_config(cert, key).await.map_err(ServerError::Tls)?;
        let listener = self.prepare()?;
        self.serve(accept_loop(TlsListener::new(listener, config))).await
    }

    fn prepare(self: &Arc<Self>) -> Result<ManagedListener, ServerError> {
        if self.state() != LifecycleState::Init || self.record.lock().is_some() {
            return Err(ServerError::AlreadyStarted(self.name.to_string()));
        }
        let record = self
            .manager
            .registry()
            .get_listener(&self.network, &self.address)?;
        self.manager.kill_parent();

        let kind = match ListenerKind::from_record(&record) {
            Ok(kind) => kind,
            Err(e) => {
                self.manager.registry().release(record.id());
                return Err(e.into());
            }
        };
        tracing::info!(
            server = %self.name,
            network = %self.network,
            address = %record.address(),
            inherited = record.is_inherited(),
            "Listener ready"
        );
        *self.record.lock() = Some(record);

        self.manager.attach_hooks(Arc::clone(&self.hooks));
        let weak = Arc::downgrade(self);
        self.manager.run_at_shutdown(with_server(&weak, |s| s.do_shutdown()));
        self.manager.run_at_hammer(with_server(&weak, |s| s.do_hammer()));

        Ok(ManagedListener::new(
            kind,
            Arc::clone(&self.name),
            Arc::clone(&self.connections),
            self.closed.watcher(),
            self.keepalive,
        ))
    }

    async fn serve<Fut>(self: &Arc<Self>, accept_loop: Fut) -> Result<(), ServerError>
    where
        Fut: Future<Output = io::Result<()>>,
    {
        let registration = match self.manager.register_server() {
            Ok(registration) => registration,
            Err(e) => {
                self.abort();
                return Err(e.into());
            }
        };
        if !self.state.transition(LifecycleState::Init, LifecycleState::Running) {
            self.abort();
            return Err(ServerError::AlreadyStarted(self.name.to_string()));
        }
        tracing::info!(server = %self.name, pid = std::process::id(), "Server started");

        let result = match accept_loop.await {
            Err(e) if is_listener_closed(&e) => Ok(()),
            other => other,
        };
        if let Err(e) = &result {
            tracing::error!(server = %self.name, error = %e, "Accept loop failed");
        }

        // The loop may have ended on its own; make sure nothing new arrives.
        self.do_shutdown();
        self.finish();
        // No accept is in flight past this point, so every connection the
        // kernel handed over is already counted.
        self.connections.stop_accepting();
        self.connections.wait_for_zero().await;
        self.state
            .transition(LifecycleState::ShuttingDown, LifecycleState::Terminate);
        self.manager.detach_hooks(&self.hooks);
        tracing::info!(server = %self.name, "Server stopped");
        registration.done();

        result.map_err(ServerError::Serve)
    }

    /// Stop accepting and close the listener. Idempotent.
    pub fn do_shutdown(&self) {
        if !self
            .state
            .transition(LifecycleState::Running, LifecycleState::ShuttingDown)
        {
            return;
        }
        tracing::info!(
            server = %self.name,
            connections = self.connections.count(),
            "Server shutting down"
        );
        if let Some(callback) = self.on_shutdown.lock().take() {
            callback();
        }
        self.finish();
    }

    /// Abandon in-flight connections.
    ///
    /// A server still running is shut down first, so a hammer that overtakes
    /// the shutdown hooks is not lost. No-op before the server started.
    pub fn do_hammer(&self) {
        if self.state() == LifecycleState::Running {
            self.do_shutdown();
        }
        if self.state() != LifecycleState::ShuttingDown {
            return;
        }
        let mut abandoned = 0usize;
        while self.state() != LifecycleState::Terminate && self.connections.force_complete() {
            abandoned += 1;
        }
        tracing::warn!(server = %self.name, abandoned, "Server hammered");
    }

    /// Close the listener and release its record. The connection counter
    /// keeps accepting until the accept loop has returned.
    fn finish(&self) {
        self.closed.close();
        if let Some(record) = self.record.lock().take() {
            self.manager.registry().release(record.id());
        }
    }

    /// Undo `prepare` for a server that never ran.
    fn abort(&self) {
        self.finish();
        self.connections.stop_accepting();
        self.manager.detach_hooks(&self.hooks);
    }

    pub fn status(&self) -> ServerStatus {
        let address = self
            .record
            .lock()
            .as_ref()
            .map(|r| r.address().to_string())
            .unwrap_or_else(|| self.address.clone());
        ServerStatus {
            name: self.name.to_string(),
            network: self.network.clone(),
            address,
            state: self.state(),
            connections: self.connections.count(),
        }
    }
}

fn with_server(
    server: &Weak<ManagedServer>,
    f: impl FnOnce(&ManagedServer) + Send + 'static,
) -> impl FnOnce() + Send + 'static {
    let server = server.clone();
    move || {
        if let Some(server) = server.upgrade() {
            f(&server);
        }
    }
}
