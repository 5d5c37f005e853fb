//! Condvar-backed wait queues.
//!
//! The spec describes three distinct waiters: the counter-overflow queue
//! (`startwrite` parks here when `COUNTER(x) == COUNTER_MAX`), the
//! write-completion queue (`unplug`/`update_sb` wait for storage I/O), and
//! the behind-writes drain (shutdown waits for `behind_writes == 0`). All
//! three are generation-counter wait queues: a producer bumps a counter and
//! wakes everyone, waiters recheck their own predicate rather than trusting
//! the wakeup alone (spurious wakeups and unrelated bumps are both
//! harmless).
use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub struct WaitQueue {
    generation: Mutex<u64>,
    condvar: Condvar,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    /// Wake every waiter. Called by the side that changed the condition the
    /// waiters are polling (e.g. `endwrite` decrementing a counter below
    /// `COUNTER_MAX`).
    pub fn wake_all(&self) {
        let mut generation = self.generation.lock().unwrap();
        *generation = generation.wrapping_add(1);
        self.condvar.notify_all();
    }

    pub fn wake_one(&self) {
        let mut generation = self.generation.lock().unwrap();
        *generation = generation.wrapping_add(1);
        self.condvar.notify_one();
    }

    /// Block until `predicate` holds. `predicate` is re-evaluated by the
    /// caller under whatever lock guards the real state; this wait queue
    /// only owns the wakeup signal, so `predicate` here is a closure over
    /// that external state and must be cheap and side-effect free.
    pub fn wait_while<F: FnMut() -> bool>(&self, mut predicate: F) {
        let guard = self.generation.lock().unwrap();
        let _unused = self
            .condvar
            .wait_while(guard, |_| predicate())
            .unwrap();
    }

    /// As `wait_while`, but gives up after `timeout` and returns whether the
    /// predicate was satisfied when it returned.
    pub fn wait_while_timeout<F: FnMut() -> bool>(&self, timeout: Duration, mut predicate: F) -> bool {
        let guard = self.generation.lock().unwrap();
        let (_guard, result) = self
            .condvar
            .wait_timeout_while(guard, timeout, |_| predicate())
            .unwrap();
        !result.timed_out()
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
