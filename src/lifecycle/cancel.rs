//! One-shot broadcast cancellation signal.
//!
//! # Responsibilities
//! - Start open, close exactly once, stay closed forever
//! - Let any number of tasks wait for the close (blocking observers)
//! - Let any number of callers poll the state (non-blocking observers)
//!
//! # Design Decisions
//! - Built on a `watch` channel so late subscribers still see the close
//! - `close()` is idempotent and reports whether this call did the closing
//! - Each signal carries a fixed [`CancelReason`]

use std::fmt;

use tokio::sync::watch;

/// Why a signal was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// Graceful shutdown has begun.
    Shutdown,
    /// In-flight work must be abandoned.
    Hammer,
    /// The process is about to exit.
    Terminate,
    /// The whole process scope has been cancelled.
    Manager,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CancelReason::Shutdown => "shutdown",
            CancelReason::Hammer => "hammer",
            CancelReason::Terminate => "terminate",
            CancelReason::Manager => "manager",
        };
        f.write_str(s)
    }
}

/// A cooperative cancellation signal.
///
/// Cloning is not supported; share it by reference or hand out
/// [`CancelWatcher`]s with [`CancelSignal::watcher`].
#[derive(Debug)]
pub struct CancelSignal {
    reason: CancelReason,
    tx: watch::Sender<bool>,
}

impl CancelSignal {
    /// Create an open signal.
    pub fn new(reason: CancelReason) -> Self {
        let (tx, _) = watch::channel(false);
        Self { reason, tx }
    }

    /// The reason attached to this signal.
    pub fn reason(&self) -> CancelReason {
        self.reason
    }

    /// Close the signal. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        self.tx.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    /// Non-blocking check.
    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the signal is closed. Returns immediately if it already is.
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot be dropped here.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// An owned handle for tasks that outlive the borrow of the signal.
    pub fn watcher(&self) -> CancelWatcher {
        CancelWatcher {
            reason: self.reason,
            rx: self.tx.subscribe(),
        }
    }
}

/// Owned, cloneable observer of a [`CancelSignal`].
#[derive(Debug, Clone)]
pub struct CancelWatcher {
    reason: CancelReason,
    rx: watch::Receiver<bool>,
}

impl CancelWatcher {
    /// The reason attached to the observed signal.
    pub fn reason(&self) -> CancelReason {
        self.reason
    }

    /// Non-blocking check.
    pub fn is_closed(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the signal is closed.
    ///
    /// A dropped signal counts as closed: nothing can ever reopen it.
    pub async fn closed(&mut self) {
        let _ = self.rx.wait_for(|closed| *closed).await;
    }

    /// Consume the watcher and wait. Handy for `with_graceful_shutdown`-style APIs.
    pub async fn closed_owned(mut self) {
        self.closed().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn close_is_idempotent() {
        let signal = CancelSignal::new(CancelReason::Shutdown);
        assert!(!signal.is_closed());
        assert!(signal.close());
        assert!(!signal.close());
        assert!(signal.is_closed());
        assert_eq!(signal.reason(), CancelReason::Shutdown);
    }

    #[tokio::test]
    async fn waiters_wake_on_close() {
        let signal = Arc::new(CancelSignal::new(CancelReason::Hammer));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let mut watcher = signal.watcher();
            handles.push(tokio::spawn(async move {
                watcher.closed().await;
                watcher.reason()
            }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        signal.close();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), CancelReason::Hammer);
        }
    }

    #[tokio::test]
    async fn late_subscriber_sees_close() {
        let signal = CancelSignal::new(CancelReason::Terminate);
        signal.close();
        let mut watcher = signal.watcher();
        assert!(watcher.is_closed());
        tokio::time::timeout(Duration::from_secs(1), watcher.closed())
            .await
            .expect("closed signal should resolve immediately");
        tokio::time::timeout(Duration::from_secs(1), signal.closed())
            .await
            .expect("closed signal should resolve immediately");
    }

    #[tokio::test]
    async fn dropped_signal_releases_watchers() {
        let signal = CancelSignal::new(CancelReason::Manager);
        let watcher = signal.watcher();
        drop(signal);
        tokio::time::timeout(Duration::from_secs(1), watcher.closed_owned())
            .await
            .expect("dropped signal should release watchers");
    }
}
