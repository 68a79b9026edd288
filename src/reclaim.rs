//! Trims data and operation log streams below what any queue still needs.
//!
//! A data stream may be consumed by several queues, so its trim point is the
//! lowest bound over all of them. Each queue's bound is the smaller of its
//! live min-unacked offset and the one in its latest durable snapshot: after a
//! crash, recovery restarts from that snapshot and must still find every
//! message it references. A queue with no durable snapshot pins its stream.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::message::{QueueId, StreamId};
use crate::metadata::MetadataService;
use crate::queue::LogicQueueManager;
use crate::snapshot::{SnapshotMark, SnapshotService};
use crate::storage::StreamStore;
use crate::sync::StopSignal;
use crate::Result;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimStats {
    pub data_streams_trimmed: usize,
    pub operation_streams_trimmed: usize,
    /// Data streams left alone because a consumer has no durable snapshot.
    pub data_streams_blocked: usize,
}

pub struct StreamReclaim {
    streams: Arc<dyn StreamStore>,
    metadata: Arc<dyn MetadataService>,
    manager: Arc<LogicQueueManager>,
    snapshots: Arc<SnapshotService>,
}

impl StreamReclaim {
    pub fn new(
        streams: Arc<dyn StreamStore>,
        metadata: Arc<dyn MetadataService>,
        manager: Arc<LogicQueueManager>,
        snapshots: Arc<SnapshotService>,
    ) -> Self {
        Self {
            streams,
            metadata,
            manager,
            snapshots,
        }
    }

    pub fn run_once(&self) -> Result<ReclaimStats> {
        let mut stats = ReclaimStats::default();
        // data stream -> lowest bound so far, None once any consumer blocks it
        let mut bounds: BTreeMap<StreamId, Option<u64>> = BTreeMap::new();

        let mut queues = self.metadata.queues();
        queues.sort_unstable();
        for queue in queues {
            let config = self.metadata.queue_config(queue)?;
            let mark = self.durable_mark(queue);
            let bound = mark.map(|mark| {
                self.manager
                    .live_min_unacked(queue)
                    .map_or(mark.min_unacked_offset, |live| live.min(mark.min_unacked_offset))
            });
            let slot = bounds.entry(config.data_stream).or_insert(Some(u64::MAX));
            *slot = match (*slot, bound) {
                (Some(current), Some(bound)) => Some(current.min(bound)),
                _ => None,
            };

            if let Some(mark) = mark {
                if self.trim_if_ahead(config.operation_stream, mark.log_offset)? {
                    stats.operation_streams_trimmed += 1;
                }
            }
        }

        for (stream, bound) in bounds {
            match bound {
                Some(bound) => {
                    if self.trim_if_ahead(stream, bound)? {
                        stats.data_streams_trimmed += 1;
                    }
                }
                None => stats.data_streams_blocked += 1,
            }
        }

        if stats.data_streams_trimmed + stats.operation_streams_trimmed > 0 {
            log::info!(
                "reclaim trimmed {} data streams and {} operation logs",
                stats.data_streams_trimmed,
                stats.operation_streams_trimmed
            );
        }
        Ok(stats)
    }

    fn durable_mark(&self, queue: QueueId) -> Option<SnapshotMark> {
        if let Some(mark) = self.snapshots.latest(queue) {
            return Some(mark);
        }
        match self.snapshots.load(queue) {
            Ok(snapshot) => snapshot.map(|snapshot| snapshot.mark()),
            Err(err) => {
                log::warn!("reclaim skips queue {queue}, snapshot unreadable: {err}");
                None
            }
        }
    }

    fn trim_if_ahead(&self, stream: StreamId, offset: u64) -> Result<bool> {
        let start = self.streams.start_offset(stream)?;
        let end = self.streams.next_offset(stream)?;
        let offset = offset.min(end);
        if offset <= start {
            return Ok(false);
        }
        self.streams.trim(stream, offset)?;
        log::debug!("trimmed {stream} from {start} to {offset}");
        Ok(true)
    }

    pub(crate) fn spawn_driver(
        self: &Arc<Self>,
        interval: Duration,
        stop: Arc<StopSignal>,
    ) -> io::Result<JoinHandle<()>> {
        let reclaim = Arc::clone(self);
        thread::Builder::new()
            .name("popstore-reclaim".to_string())
            .spawn(move || {
                while !stop.sleep(interval) {
                    if let Err(err) = reclaim.run_once() {
                        log::warn!("reclaim round failed: {err}");
                    }
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{SnapshotPolicy, StoreConfig};
    use crate::metadata::{QueueConfig, StaticMetadata};
    use crate::notifier::MessageArrivalNotifier;
    use crate::storage::{MemoryKvStore, MemoryStreamStore};
    use crate::timer::TimerWheel;

    const A: QueueId = QueueId::new(4, 0);
    const B: QueueId = QueueId::new(4, 1);

    struct Fixture {
        streams: Arc<MemoryStreamStore>,
        metadata: Arc<StaticMetadata>,
        manager: Arc<LogicQueueManager>,
        reclaim: StreamReclaim,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(0));
        let streams = Arc::new(MemoryStreamStore::new());
        let metadata = Arc::new(StaticMetadata::new());
        let snapshots = Arc::new(SnapshotService::new(Arc::new(MemoryKvStore::new())));
        let config = StoreConfig {
            snapshot: SnapshotPolicy {
                interval_ms: None,
                min_operations: None,
            },
            ..StoreConfig::default()
        };
        let manager = Arc::new(LogicQueueManager::new(
            config,
            clock.clone(),
            streams.clone(),
            metadata.clone(),
            snapshots.clone(),
            Arc::new(TimerWheel::new(clock)),
            Arc::new(MessageArrivalNotifier::new()),
        ));
        let reclaim =
            StreamReclaim::new(streams.clone(), metadata.clone(), manager.clone(), snapshots);
        Fixture {
            streams,
            metadata,
            manager,
            reclaim,
        }
    }

    fn pop(manager: &LogicQueueManager, queue: QueueId, batch: usize) -> Vec<crate::Receipt> {
        manager
            .pop(queue, batch, Duration::from_secs(30), Duration::ZERO)
            .unwrap()
    }

    #[test]
    fn test_queue_without_snapshot_blocks_trim() {
        let f = fixture();
        let config = f.metadata.register_simple(A, 1).unwrap();
        for _ in 0..3 {
            f.manager.put(A, b"m", None).unwrap();
        }
        for receipt in pop(&f.manager, A, 3) {
            f.manager.ack(A, &receipt.handle).unwrap();
        }
        let stats = f.reclaim.run_once().unwrap();
        assert_eq!(stats.data_streams_blocked, 1);
        assert_eq!(f.streams.start_offset(config.data_stream).unwrap(), 0);
    }

    #[test]
    fn test_trim_never_passes_inflight_messages() {
        let f = fixture();
        let config = f.metadata.register_simple(A, 1).unwrap();
        for _ in 0..4 {
            f.manager.put(A, b"m", None).unwrap();
        }
        let receipts = pop(&f.manager, A, 4);
        f.manager.ack(A, &receipts[0].handle).unwrap();
        f.manager.ack(A, &receipts[2].handle).unwrap();
        f.manager.snapshot(A).unwrap();

        let stats = f.reclaim.run_once().unwrap();
        assert_eq!(stats.data_streams_trimmed, 1);
        assert_eq!(stats.operation_streams_trimmed, 1);
        assert_eq!(f.streams.start_offset(config.data_stream).unwrap(), 1);
        assert_eq!(f.streams.start_offset(config.operation_stream).unwrap(), 6);

        // Acking past the durable snapshot does not move the trim point.
        f.manager.ack(A, &receipts[1].handle).unwrap();
        f.reclaim.run_once().unwrap();
        assert_eq!(f.streams.start_offset(config.data_stream).unwrap(), 1);

        f.manager.snapshot(A).unwrap();
        f.reclaim.run_once().unwrap();
        assert_eq!(f.streams.start_offset(config.data_stream).unwrap(), 3);
    }

    #[test]
    fn test_shared_data_stream_waits_for_slowest_queue() {
        let f = fixture();
        let a = f.metadata.register_simple(A, 1).unwrap();
        f.metadata
            .register(QueueConfig {
                queue: B,
                data_stream: a.data_stream,
                operation_stream: StreamId(9_001),
                max_retries: 1,
            })
            .unwrap();
        for _ in 0..3 {
            f.manager.put(A, b"m", None).unwrap();
        }
        for receipt in pop(&f.manager, A, 3) {
            f.manager.ack(A, &receipt.handle).unwrap();
        }
        let slow = pop(&f.manager, B, 1);
        f.manager.ack(B, &slow[0].handle).unwrap();
        f.manager.snapshot(A).unwrap();
        f.manager.snapshot(B).unwrap();

        f.reclaim.run_once().unwrap();
        assert_eq!(f.streams.start_offset(a.data_stream).unwrap(), 1);
    }

    #[test]
    fn test_recovery_after_reclaim_matches_live_state() {
        let f = fixture();
        f.metadata.register_simple(A, 1).unwrap();
        for _ in 0..5 {
            f.manager.put(A, b"m", None).unwrap();
        }
        let receipts = pop(&f.manager, A, 5);
        for receipt in &receipts[..3] {
            f.manager.ack(A, &receipt.handle).unwrap();
        }
        f.manager.snapshot(A).unwrap();
        f.reclaim.run_once().unwrap();
        f.manager.ack(A, &receipts[3].handle).unwrap();
        let live = f.manager.inflight(A).unwrap();

        let clock = Arc::new(ManualClock::new(0));
        let restarted = LogicQueueManager::new(
            StoreConfig::default(),
            clock.clone(),
            f.streams.clone(),
            f.metadata.clone(),
            Arc::clone(&f.reclaim.snapshots),
            Arc::new(TimerWheel::new(clock)),
            Arc::new(MessageArrivalNotifier::new()),
        );
        assert_eq!(restarted.inflight(A).unwrap(), live);
        assert_eq!(restarted.stats(A).unwrap().consume_offset, 5);
    }
}
