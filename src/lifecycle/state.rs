//! Lifecycle state machine.
//!
//! # States
//! - Init: constructed, not yet serving
//! - Running: serving traffic
//! - ShuttingDown: no new work, in-flight work draining
//! - Terminate: absorbing, process is about to exit
//!
//! # State Transitions
//! ```text
//! Init → Running: manager/server start
//! Running → ShuttingDown: graceful shutdown requested
//! ShuttingDown → Terminate: all servers done (or drained by hammer)
//! ```

use std::fmt;

use parking_lot::RwLock;
use serde::Serialize;

/// Lifecycle state shared by the manager and by each managed server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Init,
    Running,
    ShuttingDown,
    Terminate,
}

impl LifecycleState {
    /// Numeric form used for the state gauge.
    pub fn as_gauge(self) -> f64 {
        match self {
            LifecycleState::Init => 0.0,
            LifecycleState::Running => 1.0,
            LifecycleState::ShuttingDown => 2.0,
            LifecycleState::Terminate => 3.0,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Init => "init",
            LifecycleState::Running => "running",
            LifecycleState::ShuttingDown => "shutting_down",
            LifecycleState::Terminate => "terminate",
        };
        f.write_str(s)
    }
}

/// A lock-guarded [`LifecycleState`] that only moves forward.
#[derive(Debug)]
pub struct StateCell {
    state: RwLock<LifecycleState>,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LifecycleState::Init),
        }
    }

    pub fn get(&self) -> LifecycleState {
        *self.state.read()
    }

    /// Move from `expected` to `next`.
    ///
    /// Returns `false` without touching the state when the current state is
    /// not `expected`, or when `next` would not move strictly forward.
    pub fn transition(&self, expected: LifecycleState, next: LifecycleState) -> bool {
        if next <= expected {
            return false;
        }
        let mut state = self.state.write();
        if *state != expected {
            return false;
        }
        *state = next;
        true
    }

    /// Run `f` while holding the read lock, so no transition can interleave.
    pub fn with_read<R>(&self, f: impl FnOnce(LifecycleState) -> R) -> R {
        let state = self.state.read();
        f(*state)
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn transitions_only_from_expected() {
        let cell = StateCell::new();
        assert!(!cell.transition(LifecycleState::Running, LifecycleState::ShuttingDown));
        assert!(cell.transition(LifecycleState::Init, LifecycleState::Running));
        assert!(!cell.transition(LifecycleState::Init, LifecycleState::Running));
        assert!(cell.transition(LifecycleState::Running, LifecycleState::ShuttingDown));
        assert!(cell.transition(LifecycleState::ShuttingDown, LifecycleState::Terminate));
        assert_eq!(cell.get(), LifecycleState::Terminate);
    }

    #[test]
    fn never_moves_backward() {
        let cell = StateCell::new();
        assert!(cell.transition(LifecycleState::Init, LifecycleState::Running));
        assert!(!cell.transition(LifecycleState::Running, LifecycleState::Init));
        assert!(!cell.transition(LifecycleState::Running, LifecycleState::Running));
        assert_eq!(cell.get(), LifecycleState::Running);
    }

    #[test]
    fn concurrent_transitions_are_monotonic() {
        let cell = Arc::new(StateCell::new());
        let observed = Arc::new(Mutex::new(Vec::new()));
        let steps = [
            (LifecycleState::Init, LifecycleState::Running),
            (LifecycleState::Running, LifecycleState::ShuttingDown),
            (LifecycleState::ShuttingDown, LifecycleState::Terminate),
        ];

        let mut threads = Vec::new();
        for i in 0..24 {
            let cell = cell.clone();
            let observed = observed.clone();
            let (from, to) = steps[i % steps.len()];
            threads.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    if cell.transition(from, to) {
                        observed.lock().unwrap().push(to);
                    }
                    std::thread::yield_now();
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }

        let mut observed = observed.lock().unwrap().clone();
        let fired = observed.len();
        observed.sort();
        observed.dedup();
        // Each step fires at most once, and a step only fires after its predecessor.
        assert_eq!(observed.len(), fired);
        let expected: Vec<_> = steps.iter().map(|(_, to)| *to).take(fired).collect();
        assert_eq!(observed, expected);
        if let Some(last) = observed.last() {
            assert_eq!(cell.get(), *last);
        }
    }
}
