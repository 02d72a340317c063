//! Kernel threads.
//!
//! Background services (cache flushers, read-ahead, user processes) run as
//! ordinary kernel threads. The scheduler is host-provided; this module
//! wraps it behind the interface the rest of the kernel is written
//! against: named spawning, joining, and park/unpark suspension.

use std::time::Duration;

/// A handle used to wake up a parked thread.
///
/// A thread that is about to block publishes a [`ParkHandle`] (usually into
/// a waiter queue guarded by a lock) and then parks itself with
/// [`Current::park_with`]. Whoever later owns the handle calls
/// [`unpark`] to make the sleeper runnable again.
///
/// [`unpark`]: ParkHandle::unpark
pub struct ParkHandle {
    thread: std::thread::Thread,
}

impl ParkHandle {
    /// Wakes up the thread that published this handle.
    pub fn unpark(self) {
        self.thread.unpark();
    }
}

/// Operations on the current thread.
pub struct Current;

impl Current {
    /// Parks the current thread after running `f` with a wake-up handle.
    ///
    /// `f` runs before the thread suspends, so it can publish the handle
    /// while still holding whatever lock protects the waiter queue. A
    /// parked thread may wake spuriously; callers re-check their condition
    /// in a loop.
    pub fn park_with(f: impl FnOnce(ParkHandle)) {
        f(ParkHandle {
            thread: std::thread::current(),
        });
        std::thread::park();
    }

    /// Suspends the current thread for at least `dur`.
    pub fn sleep(dur: Duration) {
        std::thread::sleep(dur);
    }
}

/// A builder of a kernel thread.
pub struct ThreadBuilder {
    name: String,
}

impl ThreadBuilder {
    /// Creates a new builder for a thread named `name`.
    pub fn new<I: Into<String>>(name: I) -> Self {
        Self { name: name.into() }
    }

    /// Spawns a new kernel thread running `thread_fn`.
    pub fn spawn<F: FnOnce() + Send + 'static>(self, thread_fn: F) -> JoinHandle {
        let name = self.name.clone();
        let inner = std::thread::Builder::new()
            .name(self.name)
            .spawn(thread_fn)
            .expect("failed to spawn kernel thread");
        JoinHandle { name, inner }
    }
}

/// An owned permission to join on a thread.
pub struct JoinHandle {
    /// Name the thread was spawned with.
    pub name: String,
    inner: std::thread::JoinHandle<()>,
}

impl JoinHandle {
    /// Waits for the thread to finish.
    pub fn join(self) {
        if self.inner.join().is_err() {
            panic!("kernel thread '{}' panicked", self.name);
        }
    }
}
