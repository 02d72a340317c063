//! Blocking mutex.
//!
//! Unlike the spinlock, a [`Mutex`] puts contending threads to sleep
//! instead of burning their CPU. The mutex keeps a queue of parked
//! waiters; unlocking wakes the one at the front. Use it for critical
//! sections that are long or that perform blocking work (disk I/O, channel
//! operations) while holding the lock.

use super::spinlock::{SpinLock, WouldBlock};
use crate::thread::{Current, ParkHandle};
use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
};
use std::collections::VecDeque;

struct MutexState {
    locked: bool,
    waiters: VecDeque<ParkHandle>,
}

/// A mutual exclusion primitive useful for protecting shared data.
///
/// This mutex will block threads waiting for the lock to become available.
/// Each mutex has a type parameter which represents the data that it is
/// protecting. The data can only be accessed through the guards returned
/// from [`lock`] and [`try_lock`].
///
/// [`lock`]: Self::lock
/// [`try_lock`]: Self::try_lock
pub struct Mutex<T: ?Sized> {
    state: SpinLock<MutexState>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates a new mutex in an unlocked state ready for use.
    pub fn new(t: T) -> Mutex<T> {
        Mutex {
            state: SpinLock::new(MutexState {
                locked: false,
                waiters: VecDeque::new(),
            }),
            data: UnsafeCell::new(t),
        }
    }

    /// Consumes this mutex, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquires the mutex, blocking the current thread until it is able to
    /// do so.
    ///
    /// Upon returning, the thread is the only thread with the lock held. A
    /// guard is returned to allow scoped access to the data; release it
    /// with [`MutexGuard::unlock`] or by dropping it.
    ///
    /// Locking a mutex in the thread which already holds it deadlocks.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        loop {
            let mut state = self.state.lock();
            if !state.locked {
                state.locked = true;
                state.unlock();
                return MutexGuard {
                    lock: self,
                    _not_send: PhantomData,
                };
            }
            // Publish the wake-up handle while still holding the waiter
            // queue, then sleep. Parks may wake spuriously, hence the loop.
            Current::park_with(move |handle| {
                state.waiters.push_back(handle);
                state.unlock();
            });
        }
    }

    /// Attempts to acquire this lock.
    ///
    /// This function does not block.
    ///
    /// # Errors
    ///
    /// If the mutex is already held, returns the [`WouldBlock`] error.
    pub fn try_lock(&self) -> Result<MutexGuard<'_, T>, WouldBlock> {
        let mut state = self.state.lock();
        if state.locked {
            state.unlock();
            Err(WouldBlock)
        } else {
            state.locked = true;
            state.unlock();
            Ok(MutexGuard {
                lock: self,
                _not_send: PhantomData,
            })
        }
    }

    fn release(&self) {
        let mut state = self.state.lock();
        assert!(state.locked, "released a mutex that is not held");
        state.locked = false;
        let waiter = state.waiters.pop_front();
        state.unlock();
        if let Some(waiter) = waiter {
            waiter.unpark();
        }
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Mutex<T> {
        Mutex::new(Default::default())
    }
}

/// An implementation of a "scoped lock" of a mutex.
///
/// The data protected by the mutex can be accessed through this guard. The
/// lock is released by [`unlock`], or when the guard goes out of scope.
///
/// [`unlock`]: MutexGuard::unlock
pub struct MutexGuard<'a, T: ?Sized + 'a> {
    lock: &'a Mutex<T>,
    // A guard stays on the thread that acquired it.
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: ?Sized + Sync> Sync for MutexGuard<'_, T> {}

impl<T: ?Sized> MutexGuard<'_, T> {
    /// Releases the underlying [`Mutex`].
    #[inline]
    pub fn unlock(self) {
        drop(self);
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the mutex is held, so no other guard aliases the data.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the mutex is held, so no other guard aliases the data.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ThreadBuilder;
    use std::sync::Arc;

    #[test]
    fn contended_increments() {
        let data = Arc::new(Mutex::new(0usize));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let data = Arc::clone(&data);
            handles.push(ThreadBuilder::new("work").spawn(move || {
                for _ in 0..500 {
                    let mut guard = data.lock();
                    *guard += 1;
                    guard.unlock();
                }
            }));
        }
        for h in handles {
            h.join();
        }
        assert_eq!(*data.lock(), 4000);
    }

    #[test]
    fn try_lock() {
        let mutex = Mutex::new(1);
        let guard = mutex.lock();
        assert!(mutex.try_lock().is_err());
        guard.unlock();
        let guard = mutex.try_lock().ok().unwrap();
        assert_eq!(*guard, 1);
    }
}
