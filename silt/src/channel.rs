//! Bounded multi-producer multi-consumer channel.
//!
//! Built on a lock-free ring buffer; blocking is layered on top with a
//! mutex/condition-variable pair. Channels back the read-ahead request
//! queue of the buffer cache and the keyboard input stream. Once every
//! [`Sender`] is dropped the channel is disconnected: receivers drain the
//! remaining items and then observe [`RecvError`].

use crate::sync::{ConditionVariable, Mutex};
use crossbeam_queue::ArrayQueue;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// The receiving half of the channel was disconnected before the value
/// could be delivered.
#[derive(Debug, PartialEq, Eq)]
pub struct SendError<T>(pub T);

/// An error returned from [`Sender::try_send`].
#[derive(Debug, PartialEq, Eq)]
pub enum TrySendError<T> {
    /// The channel is full.
    Full(T),
    /// All receivers were dropped.
    Disconnected(T),
}

/// Every sender was dropped and no further values will ever arrive.
#[derive(Debug, PartialEq, Eq)]
pub struct RecvError;

struct Shared<T> {
    queue: ArrayQueue<T>,
    // Guards nothing by itself; pairs the condition variables below.
    lock: Mutex<()>,
    not_empty: ConditionVariable,
    not_full: ConditionVariable,
    senders: AtomicUsize,
    receivers: AtomicUsize,
}

/// Creates a bounded channel with room for `capacity` in-flight values.
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let shared = Arc::new(Shared {
        queue: ArrayQueue::new(capacity),
        lock: Mutex::new(()),
        not_empty: ConditionVariable::new(),
        not_full: ConditionVariable::new(),
        senders: AtomicUsize::new(1),
        receivers: AtomicUsize::new(1),
    });
    (
        Sender {
            shared: Arc::clone(&shared),
        },
        Receiver { shared },
    )
}

/// The sending half of a channel.
pub struct Sender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Sender<T> {
    /// Sends a value, blocking while the channel is full.
    ///
    /// # Errors
    ///
    /// Returns the value back inside [`SendError`] if every receiver has
    /// been dropped.
    pub fn send(&self, mut value: T) -> Result<(), SendError<T>> {
        loop {
            if self.shared.receivers.load(Ordering::SeqCst) == 0 {
                return Err(SendError(value));
            }
            match self.shared.queue.push(value) {
                Ok(()) => {
                    let guard = self.shared.lock.lock();
                    self.shared.not_empty.signal(guard);
                    return Ok(());
                }
                Err(rejected) => {
                    value = rejected;
                    let guard = self.shared.not_full.wait_while(&self.shared.lock, |_| {
                        self.shared.queue.is_full()
                            && self.shared.receivers.load(Ordering::SeqCst) > 0
                    });
                    guard.unlock();
                }
            }
        }
    }

    /// Attempts to send a value without blocking.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        if self.shared.receivers.load(Ordering::SeqCst) == 0 {
            return Err(TrySendError::Disconnected(value));
        }
        match self.shared.queue.push(value) {
            Ok(()) => {
                let guard = self.shared.lock.lock();
                self.shared.not_empty.signal(guard);
                Ok(())
            }
            Err(rejected) => Err(TrySendError::Full(rejected)),
        }
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.shared.senders.fetch_add(1, Ordering::SeqCst);
        Sender {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        if self.shared.senders.fetch_sub(1, Ordering::SeqCst) == 1 {
            // Last sender: wake receivers so they can observe the
            // disconnect.
            let guard = self.shared.lock.lock();
            self.shared.not_empty.broadcast(guard);
        }
    }
}

/// The receiving half of a channel.
pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Receiver<T> {
    /// Receives a value, blocking while the channel is empty.
    ///
    /// # Errors
    ///
    /// Returns [`RecvError`] once every sender has been dropped and the
    /// queue has been drained.
    pub fn recv(&self) -> Result<T, RecvError> {
        loop {
            if let Some(value) = self.shared.queue.pop() {
                let guard = self.shared.lock.lock();
                self.shared.not_full.signal(guard);
                return Ok(value);
            }
            if self.shared.senders.load(Ordering::SeqCst) == 0 {
                // Queue may have been refilled between the pop and the
                // sender-count check.
                return match self.shared.queue.pop() {
                    Some(value) => Ok(value),
                    None => Err(RecvError),
                };
            }
            let guard = self.shared.not_empty.wait_while(&self.shared.lock, |_| {
                self.shared.queue.is_empty()
                    && self.shared.senders.load(Ordering::SeqCst) > 0
            });
            guard.unlock();
        }
    }

    /// Attempts to receive a value without blocking.
    pub fn try_recv(&self) -> Option<T> {
        let value = self.shared.queue.pop();
        if value.is_some() {
            let guard = self.shared.lock.lock();
            self.shared.not_full.signal(guard);
        }
        value
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        if self.shared.receivers.fetch_sub(1, Ordering::SeqCst) == 1 {
            let guard = self.shared.lock.lock();
            self.shared.not_full.broadcast(guard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ThreadBuilder;

    #[test]
    fn ordered_delivery() {
        let (tx, rx) = channel(4);
        let producer = ThreadBuilder::new("producer").spawn(move || {
            for i in 0..64u32 {
                tx.send(i).unwrap();
            }
        });
        for i in 0..64u32 {
            assert_eq!(rx.recv(), Ok(i));
        }
        producer.join();
        assert_eq!(rx.recv(), Err(RecvError));
    }

    #[test]
    fn try_send_full() {
        let (tx, rx) = channel(1);
        assert!(tx.try_send(1).is_ok());
        assert_eq!(tx.try_send(2), Err(TrySendError::Full(2)));
        assert_eq!(rx.recv(), Ok(1));
    }

    #[test]
    fn disconnect_on_receiver_drop() {
        let (tx, rx) = channel(1);
        drop(rx);
        assert_eq!(tx.send(7), Err(SendError(7)));
    }
}
