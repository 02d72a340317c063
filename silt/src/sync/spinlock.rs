//! SMP-supported spinlock.
//!
//! Acquiring a spinlock polls an atomic flag until the holder releases it.
//! Spinning burns the waiter's CPU, so a spinlock is only appropriate for
//! critical sections that are short and never block: a waiter that spins on
//! a holder that has gone to sleep spins until the holder is scheduled
//! again. Longer critical sections belong under a [`Mutex`].
//!
//! [`Mutex`]: crate::sync::Mutex

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};
use crossbeam_utils::Backoff;

/// The lock could not be acquired at this time because the operation would
/// otherwise block.
pub struct WouldBlock;

/// A mutual exclusion primitive useful for protecting shared data.
///
/// Each spinlock has a type parameter which represents the data that it is
/// protecting. The data can only be accessed through the guards returned
/// from [`lock`] and [`try_lock`], which guarantees that the data is only
/// ever accessed when the spinlock is held.
///
/// [`lock`]: Self::lock
/// [`try_lock`]: Self::try_lock
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock in an unlocked state ready for use.
    #[inline]
    pub const fn new(t: T) -> SpinLock<T> {
        SpinLock {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(t),
        }
    }

    /// Consumes this spinlock, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        SpinLock::new(T::default())
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires a spinlock, spinning the current thread until it is able to
    /// do so.
    ///
    /// Upon returning, the thread is the only thread with the lock held. A
    /// guard is returned to allow scoped access to the data; release it
    /// with [`SpinLockGuard::unlock`] or by dropping it.
    ///
    /// Locking a spinlock in the thread which already holds it deadlocks.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let backoff = Backoff::new();
        while self.locked.fetch_or(true, Ordering::Acquire) {
            backoff.snooze();
        }
        SpinLockGuard { lock: self }
    }

    /// Attempts to acquire this lock.
    ///
    /// This function does not block.
    ///
    /// # Errors
    ///
    /// If the spinlock is already held, returns the [`WouldBlock`] error.
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, WouldBlock> {
        if self.locked.fetch_or(true, Ordering::Acquire) {
            Err(WouldBlock)
        } else {
            Ok(SpinLockGuard { lock: self })
        }
    }
}

/// An implementation of a "scoped lock" of a spinlock.
///
/// The data protected by the spinlock can be accessed through this guard.
/// The lock is released by [`unlock`], or when the guard goes out of scope.
///
/// [`unlock`]: SpinLockGuard::unlock
pub struct SpinLockGuard<'a, T: ?Sized + 'a> {
    lock: &'a SpinLock<T>,
}

impl<T: ?Sized> SpinLockGuard<'_, T> {
    /// Releases the underlying [`SpinLock`].
    #[inline]
    pub fn unlock(self) {
        drop(self);
    }
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the flag is held, so no other guard aliases the data.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the flag is held, so no other guard aliases the data.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn mutual_exclusion() {
        let data = Arc::new(SpinLock::new(0usize));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let data = Arc::clone(&data);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let mut guard = data.lock();
                    *guard += 1;
                    guard.unlock();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*data.lock(), 8000);
    }

    #[test]
    fn try_lock_contended() {
        let lock = SpinLock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_err());
        guard.unlock();
        assert!(lock.try_lock().is_ok());
    }
}
