//! Counting semaphore.
//!
//! A semaphore maintains a count of available permits. [`wait`] takes a
//! permit, blocking while none are available; [`signal`] returns one and
//! wakes a blocked waiter. A semaphore initialized to zero doubles as an
//! event: one thread downs it to wait for an occurrence, another ups it to
//! report one. That is how a parent waits for a child process to finish
//! loading, and how exit status hand-off is sequenced.
//!
//! [`wait`]: Semaphore::wait
//! [`signal`]: Semaphore::signal

use super::{condition_variable::ConditionVariable, mutex::Mutex};

/// A counting semaphore.
pub struct Semaphore {
    permits: Mutex<usize>,
    available: ConditionVariable,
}

impl Semaphore {
    /// Creates a new semaphore initialized with `permits` available
    /// permits.
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            available: ConditionVariable::new(),
        }
    }

    /// Waits until a permit becomes available, then takes it.
    ///
    /// If no permits are available, the current thread blocks until
    /// another thread calls [`signal`].
    ///
    /// [`signal`]: Semaphore::signal
    pub fn wait(&self) {
        let mut guard = self.available.wait_while(&self.permits, |p| *p == 0);
        *guard -= 1;
        guard.unlock();
    }

    /// Returns a permit, waking one blocked waiter if any.
    pub fn signal(&self) {
        let mut guard = self.permits.lock();
        *guard += 1;
        self.available.signal(guard);
    }
}
