//! The assembled message store: queue manager plus its background threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::clock::{Clock, QuantaClock};
use crate::config::StoreConfig;
use crate::dead_letter::{DeadLetterSender, LoggingDeadLetterSender};
use crate::inflight::InflightEntry;
use crate::message::{QueueId, Receipt, ReceiptHandle};
use crate::metadata::MetadataService;
use crate::notifier::MessageArrivalNotifier;
use crate::queue::{AckStatus, ChangeInvisibleStatus, LogicQueueManager, QueueStats};
use crate::reclaim::{ReclaimStats, StreamReclaim};
use crate::revive::ReviveCoordinator;
use crate::snapshot::{Snapshot, SnapshotService};
use crate::storage::{KvStore, MemoryKvStore, MemoryStreamStore, StreamStore};
use crate::sync::{lock, StopSignal};
use crate::timer::TimerWheel;
use crate::{Error, Result};

const SNAPSHOT_TICK_MS: u64 = 1_000;

#[derive(Default)]
pub struct MessageStoreBuilder {
    config: StoreConfig,
    clock: Option<Arc<dyn Clock>>,
    streams: Option<Arc<dyn StreamStore>>,
    kv: Option<Arc<dyn KvStore>>,
    metadata: Option<Arc<dyn MetadataService>>,
    dead_letters: Option<Arc<dyn DeadLetterSender>>,
}

impl MessageStoreBuilder {
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn stream_store(mut self, streams: Arc<dyn StreamStore>) -> Self {
        self.streams = Some(streams);
        self
    }

    pub fn kv_store(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn metadata(mut self, metadata: Arc<dyn MetadataService>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn dead_letter_sender(mut self, sender: Arc<dyn DeadLetterSender>) -> Self {
        self.dead_letters = Some(sender);
        self
    }

    /// Wires the store. Streams and the key-value store default to in-memory
    /// implementations; a metadata service is required.
    pub fn build(self) -> Result<MessageStore> {
        self.config.validate()?;
        let metadata = self
            .metadata
            .ok_or(Error::InvalidArgument("a metadata service is required"))?;
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(QuantaClock::new()));
        let streams = self
            .streams
            .unwrap_or_else(|| Arc::new(MemoryStreamStore::new()));
        let kv = self.kv.unwrap_or_else(|| Arc::new(MemoryKvStore::new()));
        let dead_letters = self
            .dead_letters
            .unwrap_or_else(|| Arc::new(LoggingDeadLetterSender));

        let snapshots = Arc::new(SnapshotService::new(kv));
        let timers = Arc::new(TimerWheel::new(Arc::clone(&clock)));
        let notifier = Arc::new(MessageArrivalNotifier::new());
        let manager = Arc::new(LogicQueueManager::new(
            self.config.clone(),
            clock,
            Arc::clone(&streams),
            Arc::clone(&metadata),
            Arc::clone(&snapshots),
            Arc::clone(&timers),
            Arc::clone(&notifier),
        ));
        let revive = Arc::new(ReviveCoordinator::new(
            Arc::clone(&manager),
            dead_letters,
            notifier,
            self.config.revive,
        ));
        let reclaim = Arc::new(StreamReclaim::new(
            streams,
            Arc::clone(&metadata),
            Arc::clone(&manager),
            snapshots,
        ));

        Ok(MessageStore {
            config: self.config,
            metadata,
            manager,
            timers,
            revive,
            reclaim,
            stop: Arc::new(StopSignal::new()),
            started: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        })
    }
}

/// Pop/ack message store over a stream store and a key-value store.
///
/// Calls work right after [`build`](MessageStoreBuilder::build); visibility
/// expiry, periodic snapshots and reclaim only run once [`start`] spawned the
/// background threads.
///
/// [`start`]: MessageStore::start
pub struct MessageStore {
    config: StoreConfig,
    metadata: Arc<dyn MetadataService>,
    manager: Arc<LogicQueueManager>,
    timers: Arc<TimerWheel>,
    revive: Arc<ReviveCoordinator>,
    reclaim: Arc<StreamReclaim>,
    stop: Arc<StopSignal>,
    started: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl MessageStore {
    pub fn builder() -> MessageStoreBuilder {
        MessageStoreBuilder::default()
    }

    /// Recovers every queue the metadata service knows and spawns the timer
    /// driver, revive workers, snapshot and reclaim threads. Queues that fail
    /// recovery stay offline; the rest start normally.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for queue in self.metadata.queues() {
            if let Err(err) = self.manager.open_queue(queue) {
                log::error!("queue {queue} failed to recover: {err}");
            }
        }

        let mut handles = lock(&self.handles);
        let (sink, expired) = mpsc::channel();
        handles.push(self.timers.spawn_driver(sink)?);
        handles.extend(self.revive.spawn_workers(expired)?);
        handles.push(self.spawn_snapshot_driver()?);
        if self.config.reclaim.enabled {
            let interval = Duration::from_millis(self.config.reclaim.interval_ms);
            handles.push(self.reclaim.spawn_driver(interval, Arc::clone(&self.stop))?);
        }
        log::info!(
            "message store started: {} queues, {} revive workers",
            self.manager.open_queues().len(),
            self.config.revive.workers
        );
        Ok(())
    }

    /// Takes a final snapshot of every loaded queue, then stops and joins the
    /// background threads. Blocked pops return `Error::Shutdown`.
    pub fn shutdown(&self) {
        if self.stop.is_stopped() {
            return;
        }
        for queue in self.manager.open_queues() {
            if let Err(err) = self.manager.snapshot(queue) {
                log::warn!("final snapshot of queue {queue} failed: {err}");
            }
        }
        self.stop.stop();
        self.manager.close();
        self.timers.shutdown();

        let handles: Vec<_> = lock(&self.handles).drain(..).collect();
        for handle in handles {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                log::error!("{name} thread panicked");
            }
        }
        log::info!("message store stopped");
    }

    pub fn pop(
        &self,
        queue: QueueId,
        batch_size: usize,
        invisible: Duration,
        max_wait: Duration,
    ) -> Result<Vec<Receipt>> {
        self.manager.pop(queue, batch_size, invisible, max_wait)
    }

    pub fn ack(&self, queue: QueueId, handle: &ReceiptHandle) -> Result<AckStatus> {
        self.manager.ack(queue, handle)
    }

    pub fn change_invisible_duration(
        &self,
        queue: QueueId,
        handle: &ReceiptHandle,
        duration: Duration,
    ) -> Result<ChangeInvisibleStatus> {
        self.manager
            .change_invisible_duration(queue, handle, duration)
    }

    pub fn put(&self, queue: QueueId, payload: &[u8]) -> Result<u64> {
        self.manager.put(queue, payload, None)
    }

    /// Appends a message that stays invisible until `deliver_at_ms`.
    pub fn put_delayed(&self, queue: QueueId, payload: &[u8], deliver_at_ms: u64) -> Result<u64> {
        self.manager.put(queue, payload, Some(deliver_at_ms))
    }

    pub fn stats(&self, queue: QueueId) -> Result<QueueStats> {
        self.manager.stats(queue)
    }

    pub fn inflight(&self, queue: QueueId) -> Result<Vec<InflightEntry>> {
        self.manager.inflight(queue)
    }

    pub fn snapshot(&self, queue: QueueId) -> Result<Option<Snapshot>> {
        self.manager.snapshot(queue)
    }

    pub fn reclaim(&self) -> Result<ReclaimStats> {
        self.reclaim.run_once()
    }

    pub fn manager(&self) -> &Arc<LogicQueueManager> {
        &self.manager
    }

    fn spawn_snapshot_driver(&self) -> std::io::Result<JoinHandle<()>> {
        let tick_ms = self
            .config
            .snapshot
            .interval_ms
            .map_or(SNAPSHOT_TICK_MS, |interval| interval.clamp(1, SNAPSHOT_TICK_MS));
        let manager = Arc::clone(&self.manager);
        let stop = Arc::clone(&self.stop);
        thread::Builder::new()
            .name("popstore-snapshot".to_string())
            .spawn(move || {
                while !stop.sleep(Duration::from_millis(tick_ms)) {
                    let taken = manager.snapshot_due();
                    if taken > 0 {
                        log::debug!("periodic snapshot wrote {taken} queues");
                    }
                }
            })
    }
}

impl Drop for MessageStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}
