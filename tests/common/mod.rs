//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use handoff::config::ListenerSettings;
use handoff::lifecycle::{Manager, ManagerOptions};
use handoff::net::ListenerRegistry;
use handoff::process::{DisabledRestarter, EnvManifest};
use handoff::supervisor::SupervisorNotifier;

pub fn options(hammer_grace: Option<Duration>) -> ManagerOptions {
    ManagerOptions {
        restartable: false,
        hammer_grace,
        terminate_delay: Duration::ZERO,
        startup_timeout: None,
    }
}

/// A started manager over a registry with `slots` startup slots.
pub fn manager_with(options: ManagerOptions, slots: usize, manifest: EnvManifest) -> Arc<Manager> {
    let registry = Arc::new(ListenerRegistry::with_manifest(
        ListenerSettings::default(),
        slots,
        manifest,
    ));
    let manager = Manager::new(
        options,
        registry,
        Arc::new(DisabledRestarter),
        SupervisorNotifier::disabled(),
    );
    manager.start();
    manager
}

pub fn manager(hammer_grace: Option<Duration>) -> Arc<Manager> {
    manager_with(options(hammer_grace), 0, EnvManifest::default())
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Await `future`, failing the test after `timeout`.
pub async fn within<F: Future>(timeout: Duration, future: F) -> F::Output {
    tokio::time::timeout(timeout, future)
        .await
        .expect("operation timed out")
}

/// A TCP port that was free a moment ago.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}
