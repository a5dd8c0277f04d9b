use mio::{Ready, Registration, SetReadiness};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Thread-safe FIFO from the broker thread to the worker.
///
/// Posting an item also flags the paired wake-up registration readable so a
/// worker blocked in `Selector::wait` revisits its loop. The worker clears
/// the flag once per turn, before draining; items posted after the clear
/// re-arm it for the next turn.
pub struct Mailbox<T> {
    queue: Mutex<VecDeque<T>>,
    wake: SetReadiness,
}

impl<T> Mailbox<T> {
    /// Creates the mailbox plus the wake-up registration the worker must
    /// keep registered on its selector.
    pub fn new() -> (Mailbox<T>, Registration) {
        let (registration, wake) = Registration::new2();

        let mailbox = Mailbox {
            queue: Mutex::new(VecDeque::new()),
            wake,
        };

        (mailbox, registration)
    }

    /// Queues an item and wakes the worker.
    pub fn post(&self, item: T) {
        self.queue
            .lock()
            .expect("Mailbox lock poisoned")
            .push_back(item);

        self.wake();
    }

    /// Flags the wake-up registration readable without queueing anything.
    /// Used to deliver the cancellation flag.
    pub fn wake(&self) {
        drop(self.wake.set_readiness(Ready::readable()));
    }

    /// Clears the wake-up readiness, best effort.
    pub fn clear_wake(&self) {
        drop(self.wake.set_readiness(Ready::empty()));
    }

    /// Takes every queued item.
    pub fn drain(&self) -> Vec<T> {
        self.queue
            .lock()
            .expect("Mailbox lock poisoned")
            .drain(..)
            .collect()
    }
}
