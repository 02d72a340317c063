//! Condition variable.
//!
//! A condition variable lets a thread sleep until shared state, guarded by
//! a [`Mutex`], reaches some condition. The APIs take the mutex (or its
//! guard) as an argument, which keeps the check-then-sleep step atomic
//! with respect to the signaling side: a waiter publishes its wake-up
//! handle before the mutex is released, so a signal issued under the same
//! mutex can never be lost.

use super::mutex::{Mutex, MutexGuard};
use crate::sync::SpinLock;
use crate::thread::{Current, ParkHandle};
use std::collections::VecDeque;

/// A condition variable.
///
/// Condition variables represent the ability to block a thread such that
/// it consumes no CPU time while waiting for an event to occur. They are
/// always associated with a boolean predicate and a mutex; the predicate
/// is verified under the mutex before the thread blocks.
#[derive(Default)]
pub struct ConditionVariable {
    waiters: SpinLock<VecDeque<ParkHandle>>,
}

impl ConditionVariable {
    /// Creates a new condition variable which is ready to be waited on and
    /// signaled.
    pub fn new() -> Self {
        Self {
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    /// Blocks the current thread while `predicate` returns `true`.
    ///
    /// The predicate is evaluated with the mutex held. While it returns
    /// `true` the thread sleeps, releasing the mutex; each wake-up
    /// reacquires the mutex and re-evaluates. On return the mutex is held
    /// and the predicate is `false`.
    ///
    /// There is no need to check the predicate before calling; the entire
    /// check-and-sleep loop happens internally.
    pub fn wait_while<'a, T: ?Sized>(
        &self,
        mutex: &'a Mutex<T>,
        predicate: impl Fn(&mut T) -> bool,
    ) -> MutexGuard<'a, T> {
        loop {
            let mut guard = mutex.lock();
            if !predicate(&mut guard) {
                return guard;
            }
            Current::park_with(|handle| {
                self.waiters.lock().push_back(handle);
                guard.unlock();
            });
        }
    }

    /// Wakes up one thread blocked on this condition variable.
    ///
    /// Consumes (and releases) the guard of the associated mutex, so the
    /// woken thread can immediately reacquire it. Signals are not
    /// buffered.
    pub fn signal<T: ?Sized>(&self, guard: MutexGuard<'_, T>) {
        let waiter = self.waiters.lock().pop_front();
        guard.unlock();
        if let Some(waiter) = waiter {
            waiter.unpark();
        }
    }

    /// Wakes up all threads blocked on this condition variable.
    pub fn broadcast<T: ?Sized>(&self, guard: MutexGuard<'_, T>) {
        let waiters: Vec<ParkHandle> = self.waiters.lock().drain(..).collect();
        guard.unlock();
        for waiter in waiters {
            waiter.unpark();
        }
    }
}
