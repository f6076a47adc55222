//! Startup orchestration.
//!
//! # Responsibilities
//! - Wait until every expected listener has been requested (or declined)
//! - Close inherited sockets nobody claimed, then report readiness
//! - Give up and shut down when startup takes too long
//!
//! # Design Decisions
//! - Fail fast: a startup timeout is treated as a failed start
//! - A shutdown during startup resolves the outstanding slots at once
//! - Readiness is reported only after unused inherited sockets are closed

use std::sync::Arc;

use tokio::task::JoinHandle;

use super::manager::Manager;
use crate::supervisor::NotifyMessage;

/// How startup ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupOutcome {
    Ready,
    TimedOut,
    ShutDown,
}

/// Spawn the startup watcher for `manager`.
pub fn spawn_startup_watcher(manager: Arc<Manager>) -> JoinHandle<StartupOutcome> {
    tokio::spawn(async move {
        let registry = Arc::clone(manager.registry());
        let timeout = manager.options().startup_timeout;
        let shutdown = manager.shutdown_signal().watcher();

        let expired = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };

        let outcome = tokio::select! {
            _ = registry.wait_for_slots() => StartupOutcome::Ready,
            _ = expired => StartupOutcome::TimedOut,
            _ = shutdown.closed_owned() => StartupOutcome::ShutDown,
        };

        let notifier = manager.notifier();
        match outcome {
            StartupOutcome::Ready => {
                registry.close_unused_provided_listeners();
                let is_child = registry
                    .manifest()
                    .map(|m| m.is_handoff_child())
                    .unwrap_or(false);
                if is_child {
                    notifier.notify(NotifyMessage::MainPid(std::process::id()));
                }
                notifier.notify(NotifyMessage::Status("ready".to_string()));
                notifier.notify(NotifyMessage::Ready);
                tracing::info!(
                    pid = std::process::id(),
                    listeners = registry.active().len(),
                    "Startup complete"
                );
            }
            StartupOutcome::TimedOut => {
                tracing::error!(
                    pending = registry.pending_slots(),
                    timeout = ?timeout,
                    "Startup timed out before all listeners were requested"
                );
                registry.drain_slots();
                registry.close_unused_provided_listeners();
                notifier.notify(NotifyMessage::Status("startup timed out".to_string()));
                notifier.notify(NotifyMessage::Stopping);
                manager.request_graceful_shutdown();
            }
            StartupOutcome::ShutDown => {
                tracing::debug!("Shutdown during startup");
                registry.drain_slots();
                registry.close_unused_provided_listeners();
            }
        }
        outcome
    })
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
    use std::time::Duration;

    fn manager(slots: usize, startup_timeout: Option<Duration>) -> Arc<Manager> {
        let registry = Arc::new(ListenerRegistry::with_manifest(
            ListenerSettings::default(),
            slots,
            EnvManifest::default(),
        ));
        Manager::new(
            ManagerOptions {
                restartable: false,
                hammer_grace: None,
                terminate_delay: Duration::ZERO,
                startup_timeout,
            },
            registry,
            Arc::new(DisabledRestarter),
            SupervisorNotifier::disabled(),
        )
    }

    #[tokio::test]
    async fn ready_once_all_slots_report() {
        let manager = manager(2, None);
        manager.start();
        let watcher = spawn_startup_watcher(manager.clone());

        manager.registry().get_listener("tcp", "127.0.0.1:0").unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!watcher.is_finished());
        manager.registry().decline_slot();

        let outcome = tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, StartupOutcome::Ready);
        assert_eq!(manager.state(), LifecycleState::Running);
    }

    #[tokio::test]
    async fn timeout_shuts_down() {
        let manager = manager(1, Some(Duration::from_millis(20)));
        manager.start();
        let outcome = spawn_startup_watcher(manager.clone()).await.unwrap();

        assert_eq!(outcome, StartupOutcome::TimedOut);
        assert_eq!(manager.registry().pending_slots(), 0);
        assert!(manager.shutdown_signal().is_closed());
    }

    #[tokio::test]
    async fn shutdown_during_startup_drains_slots() {
        let manager = manager(3, None);
        manager.start();
        let watcher = spawn_startup_watcher(manager.clone());
        manager.request_graceful_shutdown();

        let outcome = tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, StartupOutcome::ShutDown);
        assert_eq!(manager.registry().pending_slots(), 0);
    }
}
