//! handoffd: a demo service under the handoff lifecycle manager.
//!
//! # Architecture Overview
//!
//! ```text
//!   OS signals ──▶ SignalDispatcher ──▶ Manager ◀── admin API
//!                                         │
//!            ┌────────────────────────────┼───────────────────────────┐
//!            ▼                            ▼                           ▼
//!   ListenerRegistry             ManagedServer (one per        ProcessRestarter
//!   LISTEN_FDS / fresh bind      configured endpoint)          exec successor with
//!            │                            │                    inherited sockets
//!            └────────▶ ManagedListener ──┘
//!                       counted accept ──▶ hyper-util connection tasks
//! ```
//!
//! SIGHUP starts a successor that inherits every listening socket; once the
//! successor serves, it sends SIGTERM to this process, which drains and exits.

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use handoff::admin::{setup_admin_router, AdminState};
use handoff::config::{load_config, HandoffConfig, ServerConfig};
use handoff::http::{app_router, serve_http, serve_https};
use handoff::lifecycle::{spawn_startup_watcher, Manager, ManagerOptions, SignalDispatcher};
use handoff::net::ListenerRegistry;
use handoff::observability::{init_logging, metrics};
use handoff::process::{DisabledRestarter, EnvManifest, ExecRestarter, ProcessRestarter};
use handoff::server::{ManagedServer, ServerError};
use handoff::supervisor::{spawn_watchdog, SupervisorNotifier};

#[derive(Parser)]
#[command(name = "handoffd")]
#[command(about = "HTTP demo service with graceful restart and socket handoff", long_about = None)]
struct Args {
    /// Configuration file (TOML).
    #[arg(short, long, env = "HANDOFF_CONFIG", default_value = "handoff.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let config = load_config(&args.config)?;
    let logs = init_logging(&config.observability)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        config = %args.config.display(),
        "handoffd starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics endpoint");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let manifest = EnvManifest::from_env()?;
    let notifier = SupervisorNotifier::from_manifest(&manifest);
    let watchdog = manifest.watchdog;
    let registry = Arc::new(ListenerRegistry::with_manifest(
        config.listeners.clone(),
        config.listener_slots(),
        manifest,
    ));

    let manager = Manager::new(
        ManagerOptions::from(&config.lifecycle),
        registry,
        restarter(&config),
        notifier.clone(),
    );
    manager.start();

    SignalDispatcher::new(Arc::clone(&manager), Some(logs)).spawn()?;
    spawn_startup_watcher(Arc::clone(&manager));
    if let Some(interval) = watchdog {
        let state = Arc::clone(&manager);
        spawn_watchdog(
            notifier,
            interval,
            move || state.state(),
            manager.manager_signal().watcher(),
        );
    }

    let admin = config
        .admin
        .enabled
        .then(|| AdminState::new(Arc::clone(&manager), &config.admin.api_key));

    for server_config in &config.servers {
        let server = ManagedServer::with_keepalive(
            Arc::clone(&manager),
            server_config.name.clone(),
            server_config.network.clone(),
            server_config.address.clone(),
            keepalive(&config),
        );
        if let Some(admin) = &admin {
            admin.track(Arc::clone(&server));
        }
        tokio::spawn(run_server(server, server_config.clone()));
    }

    if let Some(admin) = admin {
        let server = ManagedServer::with_keepalive(
            Arc::clone(&manager),
            "admin",
            config.admin.network.clone(),
            config.admin.address.clone(),
            keepalive(&config),
        );
        let router = setup_admin_router(admin);
        tokio::spawn(async move {
            let shutdown = server.shutdown_watcher();
            let hammer = server.hammer_watcher();
            let result = server
                .listen_and_serve(|listener| serve_http(listener, router, shutdown, hammer))
                .await;
            report(&server, result);
        });
    }

    manager.done().await;
    tracing::info!(pid = std::process::id(), "Shutdown complete");
    Ok(())
}

fn restarter(config: &HandoffConfig) -> Arc<dyn ProcessRestarter> {
    if !config.lifecycle.restartable {
        return Arc::new(DisabledRestarter);
    }
    match ExecRestarter::from_process() {
        Ok(restarter) => Arc::new(restarter),
        Err(e) => {
            tracing::warn!(error = %e, "Unable to prepare restarts, SIGHUP will shut down");
            Arc::new(DisabledRestarter)
        }
    }
}

fn keepalive(config: &HandoffConfig) -> Option<Duration> {
    let secs = config.listeners.tcp_keepalive_secs;
    (secs > 0).then(|| Duration::from_secs(secs))
}

async fn run_server(server: Arc<ManagedServer>, config: ServerConfig) {
    let router = app_router(&config.name);
    let shutdown = server.shutdown_watcher();
    let hammer = server.hammer_watcher();
    let result = match &config.tls {
        Some(tls) => {
            server
                .listen_and_serve_tls(&tls.cert_path, &tls.key_path, |listener| {
                    serve_https(listener, router, shutdown, hammer)
                })
                .await
        }
        None => {
            server
                .listen_and_serve(|listener| serve_http(listener, router, shutdown, hammer))
                .await
        }
    };
    report(&server, result);
}

/// A server that cannot run takes the whole process down with it.
fn report(server: &Arc<ManagedServer>, result: Result<(), ServerError>) {
    match result {
        Ok(()) => tracing::info!(server = %server.name(), "Server stopped"),
        Err(e) => {
            tracing::error!(server = %server.name(), error = %e, "Server failed");
            server.manager().request_graceful_shutdown();
        }
    }
}
