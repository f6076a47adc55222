//! Supervisor watchdog ticker.
//!
//! Pings `WATCHDOG=1` at half the configured interval while the process is
//! running or draining. Stops at terminate or when the stop signal closes.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::notify::{NotifyMessage, SupervisorNotifier};
use crate::lifecycle::cancel::CancelWatcher;
use crate::lifecycle::state::LifecycleState;

/// Spawn the ticker. `state` is polled on every tick.
pub fn spawn_watchdog<F>(
    notifier: SupervisorNotifier,
    interval: Duration,
    state: F,
    mut stop: CancelWatcher,
) -> JoinHandle<()>
where
    F: Fn() -> LifecycleState + Send + 'static,
{
    let period = (interval / 2).max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!(period = ?period, "Watchdog started");
        loop {
            tokio::select! {
                _ = stop.closed() => break,
                _ = ticker.tick() => {}
            }
            match state() {
                LifecycleState::Running | LifecycleState::ShuttingDown => {
                    notifier.notify(NotifyMessage::Watchdog)
                }
                LifecycleState::Terminate => break,
                LifecycleState::Init => {}
            }
        }
        tracing::debug!("Watchdog stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::cancel::{CancelReason, CancelSignal};
    use crate::lifecycle::state::StateCell;
    use std::os::unix::net::UnixDatagram;
    use std::sync::Arc;

    #[tokio::test]
    async fn pings_while_running_and_stops_at_terminate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify");
        let receiver = UnixDatagram::bind(&path).unwrap();
        receiver.set_nonblocking(true).unwrap();

        let state = Arc::new(StateCell::new());
        state.transition(LifecycleState::Init, LifecycleState::Running);
        let stop = CancelSignal::new(CancelReason::Manager);

        let handle = {
            let state = state.clone();
            spawn_watchdog(
                SupervisorNotifier::new(Some(path.to_string_lossy().into_owned())),
                Duration::from_millis(40),
                move || state.get(),
                stop.watcher(),
            )
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        state.transition(LifecycleState::Running, LifecycleState::ShuttingDown);
        state.transition(LifecycleState::ShuttingDown, LifecycleState::Terminate);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("watchdog should stop at terminate")
            .unwrap();

        let mut pings = 0;
        let mut buf = [0u8; 32];
        while let Ok(n) = receiver.recv(&mut buf) {
            assert_eq!(&buf[..n], b"WATCHDOG=1");
            pings += 1;
        }
        assert!(pings >= 2, "expected at least two pings, got {pings}");
    }

    #[tokio::test]
    async fn stop_signal_ends_ticker() {
        let stop = CancelSignal::new(CancelReason::Manager);
        let handle = spawn_watchdog(
            SupervisorNotifier::disabled(),
            Duration::from_secs(60),
            || LifecycleState::Running,
            stop.watcher(),
        );
        stop.close();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("watchdog should stop")
            .unwrap();
    }
}
