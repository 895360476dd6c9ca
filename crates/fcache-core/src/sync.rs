//! Blocking signal used for frame readiness and cleanliness waits.

use std::sync::{Condvar, Mutex, PoisonError};

/// Edge-triggered broadcast signal.
///
/// [`post`](Self::post) bumps a generation counter and wakes every waiter;
/// [`wait_until`](Self::wait_until) re-evaluates its predicate under the
/// signal lock after each wake, so a post between predicate check and park
/// cannot be lost and spurious wakes are harmless. One signal serves all
/// frames of a descriptor; waiters simply re-check their own frame's flag.
#[derive(Debug, Default)]
pub struct Signal {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl Signal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every current waiter.
    pub fn post(&self) {
        let mut generation = self
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *generation = generation.wrapping_add(1);
        drop(generation);
        self.cond.notify_all();
    }

    /// Block until `done` returns true.
    ///
    /// `done` is called with the signal lock held; it must only inspect
    /// cheap state (atomic flags).
    pub fn wait_until(&self, mut done: impl FnMut() -> bool) {
        let mut generation = self
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if done() {
                return;
            }
            generation = self
                .cond
                .wait(generation)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}
