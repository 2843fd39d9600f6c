//! The binary event workers park on.

use std::sync::{Condvar, Mutex};

/// A single-waiter, auto-resetting event.
///
/// `signal` wakes the waiting thread if there is one and otherwise latches,
/// so a `signal` followed by a `wait` never blocks. `wait` consumes the
/// latch. `reset` clears a stale latch before a new park round.
pub struct AutoResetEvent {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl AutoResetEvent {
    pub fn new() -> Self {
        AutoResetEvent {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Block until the event is signaled, then clear it.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            signaled = self.cond.wait(signaled).unwrap();
        }
        *signaled = false;
    }

    /// Wake the waiter, or latch if nobody is waiting yet.
    pub fn signal(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        *signaled = true;
        self.cond.notify_one();
    }

    /// Clear any latched signal.
    pub fn reset(&self) {
        *self.signaled.lock().unwrap() = false;
    }
}

impl Default for AutoResetEvent {
    fn default() -> Self {
        Self::new()
    }
}
