//! Wakes long-poll pops when their queue may have something to deliver.
//!
//! Each queue has a generation counter. A waiter reads the generation before
//! checking the queue and then sleeps until the generation moves, so an
//! arrival between the check and the sleep is never lost.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::message::QueueId;
use crate::sync::{lock, wait, wait_timeout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Notified,
    TimedOut,
    Closed,
}

#[derive(Default)]
struct NotifierState {
    generations: HashMap<QueueId, u64>,
    closed: bool,
}

#[derive(Default)]
pub struct MessageArrivalNotifier {
    state: Mutex<NotifierState>,
    cond: Condvar,
}

impl MessageArrivalNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self, queue: QueueId) -> u64 {
        lock(&self.state)
            .generations
            .get(&queue)
            .copied()
            .unwrap_or(0)
    }

    pub fn notify(&self, queue: QueueId) {
        let mut state = lock(&self.state);
        let generation = state.generations.entry(queue).or_insert(0);
        *generation = generation.wrapping_add(1);
        drop(state);
        self.cond.notify_all();
    }

    /// Sleeps until `queue` moves past generation `seen` or `timeout` elapses.
    /// A timeout past what `Instant` can represent waits without a deadline.
    pub fn wait(&self, queue: QueueId, seen: u64, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = lock(&self.state);
        loop {
            if state.closed {
                return WaitOutcome::Closed;
            }
            if state.generations.get(&queue).copied().unwrap_or(0) != seen {
                return WaitOutcome::Notified;
            }
            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitOutcome::TimedOut;
                    }
                    wait_timeout(&self.cond, state, deadline - now)
                }
                None => wait(&self.cond, state),
            };
        }
    }

    /// Releases every waiter; later waits return immediately.
    pub fn close(&self) {
        lock(&self.state).closed = true;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{mpsc, Arc};
    use std::thread;

    const QUEUE: QueueId = QueueId::new(1, 1);

    #[test]
    fn test_wait_times_out_without_arrival() {
        let notifier = MessageArrivalNotifier::new();
        let seen = notifier.generation(QUEUE);
        notifier.notify(QueueId::new(2, 2));
        let started = Instant::now();
        assert_eq!(
            notifier.wait(QUEUE, seen, Duration::from_millis(30)),
            WaitOutcome::TimedOut
        );
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_arrival_before_wait_is_not_lost() {
        let notifier = MessageArrivalNotifier::new();
        let seen = notifier.generation(QUEUE);
        notifier.notify(QUEUE);
        assert_eq!(
            notifier.wait(QUEUE, seen, Duration::from_secs(5)),
            WaitOutcome::Notified
        );
    }

    #[test]
    fn test_notify_wakes_blocked_waiter() {
        let notifier = Arc::new(MessageArrivalNotifier::new());
        let seen = notifier.generation(QUEUE);
        let (done_tx, done_rx) = mpsc::channel();
        let waiter = Arc::clone(&notifier);
        let handle = thread::spawn(move || {
            let outcome = waiter.wait(QUEUE, seen, Duration::from_secs(5));
            let _ = done_tx.send(outcome);
        });

        assert!(done_rx.recv_timeout(Duration::from_millis(50)).is_err());
        notifier.notify(QUEUE);
        assert_eq!(
            done_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            WaitOutcome::Notified
        );
        handle.join().unwrap();
    }

    #[test]
    fn test_unbounded_wait_ends_on_notify() {
        let notifier = Arc::new(MessageArrivalNotifier::new());
        let seen = notifier.generation(QUEUE);
        let waiter = Arc::clone(&notifier);
        let handle = thread::spawn(move || waiter.wait(QUEUE, seen, Duration::MAX));
        thread::sleep(Duration::from_millis(20));
        notifier.notify(QUEUE);
        assert_eq!(handle.join().unwrap(), WaitOutcome::Notified);
    }

    #[test]
    fn test_close_releases_waiters() {
        let notifier = Arc::new(MessageArrivalNotifier::new());
        let waiter = Arc::clone(&notifier);
        let handle = thread::spawn(move || waiter.wait(QUEUE, 0, Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        notifier.close();
        assert_eq!(handle.join().unwrap(), WaitOutcome::Closed);
    }
}
