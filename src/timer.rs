//! Global delay scheduler for visibility expiry and delayed-message release.
//!
//! Entries are ordered by expire time, ties broken by insertion order.
//! Cancellation is lazy: the heap keeps the stale key and the pending map
//! decides whether it still fires. A fired entry carries only identifiers;
//! whoever consumes it must re-check queue state before acting, because a
//! cancel can race with the driver handing the entry off.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::clock::Clock;
use crate::message::QueueId;
use crate::sync::{lock, wait, wait_timeout};

pub type TimerId = u64;

/// Longest single park of the driver. Bounds the staleness of a wait computed
/// against a clock that can be moved underneath it.
const MAX_PARK: Duration = Duration::from_millis(500);
const COMPACT_SLACK: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerPayload {
    /// Visibility expiry of one delivery.
    Inflight { receipt_id: u64 },
    /// Release of a message whose delivery time lies in the future.
    Delayed { offset: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerEntry {
    pub id: TimerId,
    pub expire_ms: u64,
    pub queue: QueueId,
    pub payload: TimerPayload,
}

#[derive(Default)]
struct WheelState {
    heap: BinaryHeap<Reverse<(u64, TimerId)>>,
    pending: HashMap<TimerId, TimerEntry>,
    next_id: TimerId,
    shutdown: bool,
}

impl WheelState {
    /// Drops cancelled keys sitting on top of the heap.
    fn skip_cancelled(&mut self) {
        while let Some(Reverse((_, id))) = self.heap.peek() {
            if self.pending.contains_key(id) {
                break;
            }
            self.heap.pop();
        }
    }

    fn pop_due(&mut self, now_ms: u64) -> Option<TimerEntry> {
        self.skip_cancelled();
        let Reverse((expire_ms, id)) = *self.heap.peek()?;
        if expire_ms > now_ms {
            return None;
        }
        self.heap.pop();
        self.pending.remove(&id)
    }

    fn compact(&mut self) {
        if self.heap.len() <= self.pending.len() * 2 + COMPACT_SLACK {
            return;
        }
        self.heap = self
            .pending
            .values()
            .map(|entry| Reverse((entry.expire_ms, entry.id)))
            .collect();
    }
}

pub struct TimerWheel {
    state: Mutex<WheelState>,
    cond: Condvar,
    clock: Arc<dyn Clock>,
}

impl TimerWheel {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(WheelState::default()),
            cond: Condvar::new(),
            clock,
        }
    }

    pub fn schedule(&self, queue: QueueId, expire_ms: u64, payload: TimerPayload) -> TimerId {
        let mut state = lock(&self.state);
        let id = state.next_id;
        state.next_id += 1;
        let becomes_first = state
            .heap
            .peek()
            .map_or(true, |Reverse((first, _))| expire_ms < *first);
        state.heap.push(Reverse((expire_ms, id)));
        state.pending.insert(
            id,
            TimerEntry {
                id,
                expire_ms,
                queue,
                payload,
            },
        );
        drop(state);
        if becomes_first {
            self.cond.notify_all();
        }
        id
    }

    /// Returns false when the entry already fired or was cancelled.
    pub fn cancel(&self, id: TimerId) -> bool {
        let mut state = lock(&self.state);
        let removed = state.pending.remove(&id).is_some();
        if removed {
            state.compact();
        }
        removed
    }

    /// Removes and returns every entry due at `now_ms`, earliest first.
    pub fn poll_due(&self, now_ms: u64) -> Vec<TimerEntry> {
        let mut state = lock(&self.state);
        let mut due = Vec::new();
        while let Some(entry) = state.pop_due(now_ms) {
            due.push(entry);
        }
        due
    }

    /// Blocks until the earliest entry is due and returns it. Returns `None`
    /// once the wheel is shut down.
    pub fn next_due(&self) -> Option<TimerEntry> {
        let mut state = lock(&self.state);
        loop {
            if state.shutdown {
                return None;
            }
            let now_ms = self.clock.now_ms();
            if let Some(entry) = state.pop_due(now_ms) {
                return Some(entry);
            }
            let next_expiry = state.heap.peek().map(|Reverse((expire_ms, _))| *expire_ms);
            state = match next_expiry {
                Some(expire_ms) => {
                    let park = Duration::from_millis(expire_ms - now_ms).min(MAX_PARK);
                    wait_timeout(&self.cond, state, park)
                }
                None => wait(&self.cond, state),
            };
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.state).pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        lock(&self.state).pending.contains_key(&id)
    }

    pub fn next_expiry_ms(&self) -> Option<u64> {
        let mut state = lock(&self.state);
        state.skip_cancelled();
        state.heap.peek().map(|Reverse((expire_ms, _))| *expire_ms)
    }

    pub fn shutdown(&self) {
        lock(&self.state).shutdown = true;
        self.cond.notify_all();
    }

    /// Spawns the dispatch loop. Due entries are handed to `sink` without
    /// waiting on whoever consumes them; the loop exits on shutdown or when the
    /// receiving side is gone.
    pub fn spawn_driver(self: &Arc<Self>, sink: Sender<TimerEntry>) -> io::Result<JoinHandle<()>> {
        let wheel = Arc::clone(self);
        thread::Builder::new()
            .name("popstore-timer".to_string())
            .spawn(move || {
                while let Some(entry) = wheel.next_due() {
                    if sink.send(entry).is_err() {
                        log::debug!("timer sink closed, stopping driver");
                        break;
                    }
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use std::sync::mpsc;

    const QUEUE: QueueId = QueueId::new(1, 0);

    fn inflight(receipt_id: u64) -> TimerPayload {
        TimerPayload::Inflight { receipt_id }
    }

    #[test]
    fn test_poll_due_orders_by_expiry_then_insertion() {
        let wheel = TimerWheel::new(Arc::new(ManualClock::new(0)));
        wheel.schedule(QUEUE, 300, inflight(1));
        wheel.schedule(QUEUE, 100, inflight(2));
        wheel.schedule(QUEUE, 100, inflight(3));
        wheel.schedule(QUEUE, 900, inflight(4));

        assert!(wheel.poll_due(99).is_empty());
        let due: Vec<_> = wheel.poll_due(300).into_iter().map(|e| e.payload).collect();
        assert_eq!(due, vec![inflight(2), inflight(3), inflight(1)]);
        assert_eq!(wheel.len(), 1);
        assert_eq!(wheel.next_expiry_ms(), Some(900));
    }

    #[test]
    fn test_cancelled_entry_never_fires() {
        let wheel = TimerWheel::new(Arc::new(ManualClock::new(0)));
        let first = wheel.schedule(QUEUE, 10, inflight(1));
        let second = wheel.schedule(QUEUE, 20, inflight(2));
        assert!(wheel.cancel(first));
        assert!(!wheel.cancel(first));
        assert_eq!(wheel.next_expiry_ms(), Some(20));

        let due = wheel.poll_due(100);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, second);
        assert!(!wheel.cancel(second));
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_heap_is_compacted_after_mass_cancel() {
        let wheel = TimerWheel::new(Arc::new(ManualClock::new(0)));
        let ids: Vec<_> = (0..1_000).map(|i| wheel.schedule(QUEUE, i, inflight(i))).collect();
        for id in &ids[..990] {
            wheel.cancel(*id);
        }
        assert!(lock(&wheel.state).heap.len() <= 10 * 2 + COMPACT_SLACK);
        assert_eq!(wheel.poll_due(u64::MAX).len(), 10);
    }

    #[test]
    fn test_driver_dispatches_due_entries() {
        let clock = Arc::new(SystemClock);
        let wheel = Arc::new(TimerWheel::new(clock.clone()));
        let (tx, rx) = mpsc::channel();
        let handle = wheel.spawn_driver(tx).unwrap();

        let now = clock.now_ms();
        wheel.schedule(QUEUE, now + 40, inflight(2));
        wheel.schedule(QUEUE, now + 10, inflight(1));
        let cancelled = wheel.schedule(QUEUE, now + 20, inflight(9));
        wheel.cancel(cancelled);

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first.payload, inflight(1));
        assert_eq!(second.payload, inflight(2));
        assert!(second.expire_ms <= clock.now_ms());

        wheel.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn test_shutdown_unblocks_idle_driver() {
        let wheel = Arc::new(TimerWheel::new(Arc::new(SystemClock)));
        let (tx, _rx) = mpsc::channel();
        let handle = wheel.spawn_driver(tx).unwrap();
        thread::sleep(Duration::from_millis(20));
        wheel.shutdown();
        handle.join().unwrap();
        assert!(wheel.next_due().is_none());
    }
}
