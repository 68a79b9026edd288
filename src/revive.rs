//! Revive coordinator: turns fired timers into retries and dead-letters.
//!
//! The timer driver hands due entries over a channel; one or more workers
//! drain it. Every decision is made by the queue manager under the queue's
//! lock, so a stale or duplicated timer is a no-op. The dead-letter send runs
//! without any queue lock held.

use std::io;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::config::ReviveConfig;
use crate::dead_letter::DeadLetterSender;
use crate::notifier::MessageArrivalNotifier;
use crate::queue::{Expiry, LogicQueueManager};
use crate::sync::lock;
use crate::timer::TimerEntry;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviveOutcome {
    Discarded,
    Retried,
    DeadLettered,
    /// The dead-letter send failed; the delivery was re-armed with backoff.
    Deferred,
    /// Pops were woken: a delayed message became due or a retry is waiting.
    Released,
    /// The delivery's window was still open; its timer moved to the window end.
    Rescheduled,
}

pub struct ReviveCoordinator {
    manager: Arc<LogicQueueManager>,
    sender: Arc<dyn DeadLetterSender>,
    notifier: Arc<MessageArrivalNotifier>,
    config: ReviveConfig,
}

impl ReviveCoordinator {
    pub fn new(
        manager: Arc<LogicQueueManager>,
        sender: Arc<dyn DeadLetterSender>,
        notifier: Arc<MessageArrivalNotifier>,
        config: ReviveConfig,
    ) -> Self {
        Self {
            manager,
            sender,
            notifier,
            config,
        }
    }

    pub fn handle(&self, entry: &TimerEntry) -> Result<ReviveOutcome> {
        match self.manager.expire(entry)? {
            Expiry::Discarded => Ok(ReviveOutcome::Discarded),
            Expiry::Rescheduled { .. } => Ok(ReviveOutcome::Rescheduled),
            Expiry::Retried { .. } => {
                self.notifier.notify(entry.queue);
                Ok(ReviveOutcome::Retried)
            }
            Expiry::Released | Expiry::Pending => {
                self.notifier.notify(entry.queue);
                Ok(ReviveOutcome::Released)
            }
            Expiry::DeadLetter {
                receipt_id,
                message,
            } => match self.sender.send(&message) {
                Ok(()) => {
                    self.manager
                        .complete_dead_letter(entry.queue, receipt_id, message.attempts)?;
                    Ok(ReviveOutcome::DeadLettered)
                }
                Err(err) => {
                    log::warn!(
                        "dead-letter send for queue {} offset {} failed: {err}",
                        entry.queue,
                        message.offset
                    );
                    self.manager.defer_dead_letter(entry.queue, receipt_id)?;
                    Ok(ReviveOutcome::Deferred)
                }
            },
        }
    }

    /// Handles one entry, putting the timer back with backoff if handling fails.
    pub fn process(&self, entry: &TimerEntry) -> Option<ReviveOutcome> {
        match self.handle(entry) {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                let delay = self.config.dead_letter_retry.backoff(1);
                log::warn!(
                    "expiry of timer {} on queue {} failed, retrying in {delay:?}: {err}",
                    entry.id,
                    entry.queue
                );
                if let Err(err) = self.manager.rearm_expiry(entry, delay) {
                    log::error!("could not re-arm timer {} on queue {}: {err}", entry.id, entry.queue);
                }
                None
            }
        }
    }

    /// Spawns `config.workers` threads sharing `receiver`. They exit when the
    /// sending side (the timer driver) is gone.
    pub fn spawn_workers(
        self: &Arc<Self>,
        receiver: Receiver<TimerEntry>,
    ) -> io::Result<Vec<JoinHandle<()>>> {
        let receiver = Arc::new(Mutex::new(receiver));
        (0..self.config.workers.max(1))
            .map(|index| {
                let coordinator = Arc::clone(self);
                let receiver = Arc::clone(&receiver);
                thread::Builder::new()
                    .name(format!("popstore-revive-{index}"))
                    .spawn(move || loop {
                        let next = lock(&receiver).recv();
                        let Ok(entry) = next else {
                            log::debug!("revive worker {index} stopping");
                            break;
                        };
                        coordinator.process(&entry);
                    })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::{SnapshotPolicy, StoreConfig};
    use crate::dead_letter::MemoryDeadLetterSender;
    use crate::message::QueueId;
    use crate::metadata::StaticMetadata;
    use crate::snapshot::SnapshotService;
    use crate::storage::{MemoryKvStore, MemoryStreamStore};
    use crate::timer::TimerWheel;
    use std::time::Duration;

    const QUEUE: QueueId = QueueId::new(2, 0);

    struct Fixture {
        clock: Arc<ManualClock>,
        streams: Arc<MemoryStreamStore>,
        timers: Arc<TimerWheel>,
        manager: Arc<LogicQueueManager>,
        sender: Arc<MemoryDeadLetterSender>,
        coordinator: ReviveCoordinator,
    }

    fn fixture(max_retries: u32) -> Fixture {
        let clock = Arc::new(ManualClock::new(50_000));
        let streams = Arc::new(MemoryStreamStore::new());
        let metadata = Arc::new(StaticMetadata::new());
        metadata.register_simple(QUEUE, max_retries).unwrap();
        let timers = Arc::new(TimerWheel::new(clock.clone()));
        let notifier = Arc::new(MessageArrivalNotifier::new());
        let mut config = StoreConfig::default();
        config.snapshot = SnapshotPolicy {
            interval_ms: None,
            min_operations: None,
        };
        config.append_retry.max_attempts = 1;
        let manager = Arc::new(LogicQueueManager::new(
            config.clone(),
            clock.clone(),
            streams.clone(),
            metadata,
            Arc::new(SnapshotService::new(Arc::new(MemoryKvStore::new()))),
            timers.clone(),
            notifier.clone(),
        ));
        let sender = Arc::new(MemoryDeadLetterSender::new());
        let coordinator =
            ReviveCoordinator::new(manager.clone(), sender.clone(), notifier, config.revive);
        Fixture {
            clock,
            streams,
            timers,
            manager,
            sender,
            coordinator,
        }
    }

    impl Fixture {
        fn pop(&self) {
            self.manager
                .pop(QUEUE, 1, Duration::from_secs(1), Duration::ZERO)
                .unwrap();
        }

        fn drain(&self) -> Vec<Option<ReviveOutcome>> {
            self.timers
                .poll_due(self.clock.now_ms())
                .iter()
                .map(|entry| self.coordinator.process(entry))
                .collect()
        }
    }

    #[test]
    fn test_zero_retries_dead_letters_on_first_expiry() {
        let f = fixture(0);
        f.manager.put(QUEUE, b"bad", None).unwrap();
        f.pop();
        f.clock.advance_ms(1_000);
        assert_eq!(f.drain(), vec![Some(ReviveOutcome::DeadLettered)]);

        let sent = f.sender.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].attempts, 1);
        assert_eq!(f.manager.stats(QUEUE).unwrap().inflight, 0);
    }

    #[test]
    fn test_send_failure_keeps_message_inflight_until_sent() {
        let f = fixture(0);
        f.manager.put(QUEUE, b"bad", None).unwrap();
        f.pop();
        f.sender.fail_next_sends(2);

        f.clock.advance_ms(1_000);
        assert_eq!(f.drain(), vec![Some(ReviveOutcome::Deferred)]);
        assert_eq!(f.manager.stats(QUEUE).unwrap().inflight, 1);

        // Backoff doubles: 1s, then 2s.
        f.clock.advance_ms(1_000);
        assert_eq!(f.drain(), vec![Some(ReviveOutcome::Deferred)]);
        f.clock.advance_ms(1_999);
        assert!(f.drain().is_empty());
        f.clock.advance_ms(1);
        assert_eq!(f.drain(), vec![Some(ReviveOutcome::DeadLettered)]);
        assert_eq!(f.sender.sent().len(), 1);
        assert_eq!(f.manager.stats(QUEUE).unwrap().inflight, 0);
    }

    #[test]
    fn test_failed_timeout_append_is_retried() {
        let f = fixture(3);
        f.manager.put(QUEUE, b"m", None).unwrap();
        f.pop();
        f.clock.advance_ms(1_000);
        f.streams.fail_next_appends(1);
        assert_eq!(f.drain(), vec![None]);
        assert_eq!(f.manager.inflight(QUEUE).unwrap()[0].attempts, 0);

        f.clock.advance_ms(1_000);
        assert_eq!(f.drain(), vec![Some(ReviveOutcome::Retried)]);
        assert_eq!(f.manager.inflight(QUEUE).unwrap()[0].attempts, 1);
    }

    #[test]
    fn test_workers_drain_channel_until_sender_drops() {
        let f = fixture(1);
        f.manager.put(QUEUE, b"m", None).unwrap();
        f.pop();
        f.clock.advance_ms(1_000);

        let coordinator = Arc::new(ReviveCoordinator::new(
            f.manager.clone(),
            f.sender.clone(),
            Arc::new(MessageArrivalNotifier::new()),
            ReviveConfig {
                workers: 2,
                ..ReviveConfig::default()
            },
        ));
        let (tx, rx) = std::sync::mpsc::channel();
        let workers = coordinator.spawn_workers(rx).unwrap();
        for entry in f.timers.poll_due(f.clock.now_ms()) {
            tx.send(entry).unwrap();
        }
        drop(tx);
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(f.manager.stats(QUEUE).unwrap().ready, 1);
    }
}
