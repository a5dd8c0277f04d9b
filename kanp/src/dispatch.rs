use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Serializes callables onto the single logical owner thread.
///
/// Any model that runs submitted tasks one at a time on one thread satisfies
/// the contract: a GUI main loop, a single-threaded executor, or the queue
/// pump below.
pub trait UiDispatcher: Send + Sync {
    fn submit(&self, task: Task);
}

/// Queue-backed dispatcher half. Submissions never block; tasks run when the
/// owning thread pumps the paired `DispatchQueue`.
pub struct QueueDispatcher {
    tx: Mutex<Sender<Task>>,
}

impl UiDispatcher for QueueDispatcher {
    fn submit(&self, task: Task) {
        // A dropped queue means the owner is gone; late submissions are
        // discarded.
        drop(self.tx.lock().expect("Dispatcher lock poisoned").send(task));
    }
}

/// Owner-thread pump half of a `QueueDispatcher`.
pub struct DispatchQueue {
    rx: Receiver<Task>,
}

impl DispatchQueue {
    pub fn new() -> (Arc<QueueDispatcher>, DispatchQueue) {
        let (tx, rx) = mpsc::channel();

        (
            Arc::new(QueueDispatcher { tx: Mutex::new(tx) }),
            DispatchQueue { rx },
        )
    }

    /// Runs every task currently queued without blocking. Returns the number
    /// of tasks run.
    pub fn run_pending(&self) -> usize {
        let mut count = 0;

        while let Ok(task) = self.rx.try_recv() {
            task();
            count += 1;
        }

        count
    }

    /// Pumps tasks for the given duration. Returns the number of tasks run.
    pub fn pump_for(&self, duration: Duration) -> usize {
        let deadline = Instant::now() + duration;
        let mut count = 0;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return count;
            }

            match self.rx.recv_timeout(deadline - now) {
                Ok(task) => {
                    task();
                    count += 1;
                }
                Err(RecvTimeoutError::Timeout) => return count,
                Err(RecvTimeoutError::Disconnected) => return count,
            }
        }
    }

    /// Pumps tasks until the predicate holds or the timeout elapses. Returns
    /// whether the predicate was satisfied.
    pub fn pump_until<F: FnMut() -> bool>(&self, timeout: Duration, mut pred: F) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            if pred() {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            match self.rx.recv_timeout(deadline - now) {
                Ok(task) => task(),
                Err(RecvTimeoutError::Timeout) => return pred(),
                Err(RecvTimeoutError::Disconnected) => return pred(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_tasks_run_in_submission_order() {
        let (dispatcher, queue) = DispatchQueue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for value in 0..5 {
            let seen = seen.clone();
            dispatcher.submit(Box::new(move || seen.lock().unwrap().push(value)));
        }

        assert_eq!(queue.run_pending(), 5);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_submit_from_other_thread() {
        let (dispatcher, queue) = DispatchQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let handle = {
            let dispatcher = dispatcher.clone();
            let counter = counter.clone();

            thread::spawn(move || {
                for _ in 0..3 {
                    let counter = counter.clone();
                    dispatcher.submit(Box::new(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }));
                }
            })
        };

        handle.join().unwrap();

        let counter_check = counter.clone();
        assert!(queue.pump_until(Duration::from_secs(1), move || {
            counter_check.load(Ordering::SeqCst) == 3
        }));
    }

    #[test]
    fn test_pump_until_times_out() {
        let (_dispatcher, queue) = DispatchQueue::new();

        assert!(!queue.pump_until(Duration::from_millis(20), || false));
    }
}
