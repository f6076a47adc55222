//! Guarded completion counter.
//!
//! # Responsibilities
//! - Count outstanding units of work (connections, running servers, startup slots)
//! - Refuse new registrations once the counter stops accepting
//! - Wake waiters when the count reaches zero
//!
//! # Design Decisions
//! - Registration reports rejection as `false`, never as an error
//! - Decrement saturates at zero and reports the condition instead of panicking
//! - A forced drain (hammer) ends the bookkeeping: later completions are ignored

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct CounterState {
    count: usize,
    accepting: bool,
    drained: bool,
}

/// A wait-group that cannot be re-armed after it has been told to stop.
#[derive(Debug)]
pub struct CompletionCounter {
    state: Mutex<CounterState>,
    zero: Notify,
}

impl CompletionCounter {
    pub fn new() -> Self {
        Self::with_count(0)
    }

    /// A counter that starts with `count` outstanding registrations.
    pub fn with_count(count: usize) -> Self {
        Self {
            state: Mutex::new(CounterState {
                count,
                accepting: true,
                drained: false,
            }),
            zero: Notify::new(),
        }
    }

    /// Register one unit of work. Returns `false` once the counter stopped accepting.
    pub fn register_if_accepting(&self) -> bool {
        let mut state = self.state.lock();
        if !state.accepting {
            return false;
        }
        state.count += 1;
        true
    }

    /// Register and hand back a guard that completes on drop.
    pub fn guard(self: &Arc<Self>) -> Option<CompletionGuard> {
        self.register_if_accepting().then(|| CompletionGuard {
            counter: Arc::clone(self),
            done: false,
        })
    }

    /// Complete one unit of work.
    ///
    /// Returns `false` when there was nothing to complete (count already zero,
    /// or the counter was drained by [`force_complete`](Self::force_complete)).
    pub fn complete(&self) -> bool {
        let mut state = self.state.lock();
        if state.drained {
            return false;
        }
        if state.count == 0 {
            return false;
        }
        state.count -= 1;
        if state.count == 0 {
            self.zero.notify_waiters();
        }
        true
    }

    /// Forcibly complete one unit of work on behalf of an unfinished holder.
    ///
    /// Returns `false` once the counter is already at zero, which is the
    /// expected end of a hammer drain rather than a fault.
    pub fn force_complete(&self) -> bool {
        let mut state = self.state.lock();
        state.drained = true;
        state.accepting = false;
        if state.count == 0 {
            self.zero.notify_waiters();
            return false;
        }
        state.count -= 1;
        if state.count == 0 {
            self.zero.notify_waiters();
        }
        true
    }

    /// Stop accepting registrations. Returns `true` for the call that flipped it.
    pub fn stop_accepting(&self) -> bool {
        let mut state = self.state.lock();
        let flipped = state.accepting;
        state.accepting = false;
        flipped
    }

    pub fn is_accepting(&self) -> bool {
        self.state.lock().accepting
    }

    pub fn count(&self) -> usize {
        self.state.lock().count
    }

    /// Whether a forced drain has happened.
    pub fn is_drained(&self) -> bool {
        self.state.lock().drained
    }

    /// Wait until the count reaches zero.
    pub async fn wait_for_zero(&self) {
        loop {
            let notified = self.zero.notified();
            tokio::pin!(notified);
            // Register interest before checking, so a completion in between is not lost.
            notified.as_mut().enable();
            if self.state.lock().count == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Default for CompletionCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Completes one registration on drop.
#[derive(Debug)]
pub struct CompletionGuard {
    counter: Arc<CompletionCounter>,
    done: bool,
}

impl CompletionGuard {
    /// Complete explicitly. Later drops are no-ops.
    pub fn done(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if !self.done {
            self.done = true;
            if !self.counter.complete() && !self.counter.is_drained() {
                tracing::warn!("completion guard released against an empty counter");
            }
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.finish();
    }
}
