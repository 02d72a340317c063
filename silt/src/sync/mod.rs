//! Synchronization primitives.
//!
//! Three tiers, from cheapest to most capable:
//!
//! - [`SpinLock`] busy-waits; use it for short, non-blocking critical
//!   sections such as queue manipulation.
//! - [`Mutex`] sleeps contending threads; use it when the critical section
//!   is long or performs blocking work such as disk I/O.
//! - [`ConditionVariable`] and [`Semaphore`] build on the mutex to wait
//!   for state changes and to count resources or events.

pub mod condition_variable;
pub mod mutex;
pub mod semaphore;
pub mod spinlock;

pub use condition_variable::ConditionVariable;
pub use mutex::{Mutex, MutexGuard};
pub use semaphore::Semaphore;
pub use spinlock::{SpinLock, SpinLockGuard, WouldBlock};
