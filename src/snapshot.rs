use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::config::SnapshotPolicy;
use crate::inflight::InflightEntry;
use crate::message::QueueId;
use crate::storage::KvStore;
use crate::sync::lock;
use crate::{Error, Result};

pub const SNAPSHOT_NAMESPACE: &str = "snapshot";
pub const SNAPSHOT_VERSION: u32 = 1;

/// Consistent checkpoint of one queue's consumption state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub queue: QueueId,
    pub consume_offset: u64,
    pub min_unacked_offset: u64,
    pub next_receipt_id: u64,
    /// First operation log offset not reflected in this snapshot.
    pub log_offset: u64,
    pub taken_at_ms: u64,
    pub inflight: Vec<InflightEntry>,
}

impl Snapshot {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(queue: QueueId, data: &[u8]) -> Result<Self> {
        let snapshot: Self = serde_json::from_slice(data)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::Corrupt(format!(
                "snapshot of queue {queue} has unsupported version {}",
                snapshot.version
            )));
        }
        if snapshot.queue != queue {
            return Err(Error::Corrupt(format!(
                "snapshot stored for queue {queue} belongs to {}",
                snapshot.queue
            )));
        }
        Ok(snapshot)
    }

    pub fn mark(&self) -> SnapshotMark {
        SnapshotMark {
            log_offset: self.log_offset,
            consume_offset: self.consume_offset,
            min_unacked_offset: self.min_unacked_offset,
        }
    }
}

/// The parts of the latest durable snapshot that bound reclaim.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnapshotMark {
    pub log_offset: u64,
    pub consume_offset: u64,
    pub min_unacked_offset: u64,
}

/// Decides when a queue is due for a snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotPlanner {
    policy: SnapshotPolicy,
    last_snapshot_ms: Option<u64>,
    operations_since: u64,
}

impl SnapshotPlanner {
    pub fn new(policy: SnapshotPolicy) -> Self {
        Self {
            policy,
            last_snapshot_ms: None,
            operations_since: 0,
        }
    }

    pub fn observe(&mut self, operations: u64) {
        self.operations_since = self.operations_since.saturating_add(operations);
    }

    pub fn operations_since(&self) -> u64 {
        self.operations_since
    }

    /// A queue with nothing new since its last snapshot is never due.
    pub fn should_snapshot(&self, now_ms: u64) -> bool {
        if self.operations_since == 0 {
            return false;
        }
        let mut due = false;
        if let Some(min_operations) = self.policy.min_operations {
            due |= self.operations_since >= min_operations;
        }
        if let Some(interval_ms) = self.policy.interval_ms {
            due |= match self.last_snapshot_ms {
                Some(last) => now_ms.saturating_sub(last) >= interval_ms,
                None => true,
            };
        }
        due
    }

    /// Records a successful snapshot that covered `covered` operations.
    pub fn mark_snapshot(&mut self, now_ms: u64, covered: u64) {
        self.last_snapshot_ms = Some(now_ms);
        self.operations_since = self.operations_since.saturating_sub(covered);
    }
}

/// Persists snapshots in the key-value store and remembers the latest durable
/// one per queue.
pub struct SnapshotService {
    kv: Arc<dyn KvStore>,
    durable: Mutex<HashMap<QueueId, SnapshotMark>>,
}

impl SnapshotService {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            durable: Mutex::new(HashMap::new()),
        }
    }

    /// Writes `snapshot` unless a snapshot at a later log offset is already
    /// durable. Returns whether it was written.
    ///
    /// Callers serialize persists of the same queue.
    pub fn persist(&self, snapshot: &Snapshot) -> Result<bool> {
        if let Some(mark) = self.latest(snapshot.queue) {
            if mark.log_offset > snapshot.log_offset {
                log::debug!(
                    "skipping stale snapshot of queue {} at log offset {} (durable {})",
                    snapshot.queue,
                    snapshot.log_offset,
                    mark.log_offset
                );
                return Ok(false);
            }
        }
        let data = snapshot.encode()?;
        self.kv
            .put(SNAPSHOT_NAMESPACE, &snapshot.queue.kv_key(), &data)?;
        lock(&self.durable).insert(snapshot.queue, snapshot.mark());
        log::debug!(
            "persisted snapshot of queue {} at log offset {} ({} inflight)",
            snapshot.queue,
            snapshot.log_offset,
            snapshot.inflight.len()
        );
        Ok(true)
    }

    pub fn load(&self, queue: QueueId) -> Result<Option<Snapshot>> {
        let Some(data) = self.kv.get(SNAPSHOT_NAMESPACE, &queue.kv_key())? else {
            return Ok(None);
        };
        let snapshot = Snapshot::decode(queue, &data)?;
        lock(&self.durable).insert(queue, snapshot.mark());
        Ok(Some(snapshot))
    }

    pub fn latest(&self, queue: QueueId) -> Option<SnapshotMark> {
        lock(&self.durable).get(&queue).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inflight::InflightState;
    use crate::storage::MemoryKvStore;

    const QUEUE: QueueId = QueueId::new(3, 1);

    fn snapshot(log_offset: u64) -> Snapshot {
        Snapshot {
            version: SNAPSHOT_VERSION,
            queue: QUEUE,
            consume_offset: 12,
            min_unacked_offset: 10,
            next_receipt_id: 4,
            log_offset,
            taken_at_ms: 1_000,
            inflight: vec![InflightEntry {
                receipt_id: 3,
                offset: 10,
                pop_ms: 900,
                invisible_until_ms: 1_900,
                attempts: 1,
                state: InflightState::Delivered,
            }],
        }
    }

    #[test]
    fn test_snapshot_persist_and_load() {
        let kv = Arc::new(MemoryKvStore::new());
        let service = SnapshotService::new(kv.clone());
        assert!(service.load(QUEUE).unwrap().is_none());
        assert!(service.persist(&snapshot(7)).unwrap());

        let reopened = SnapshotService::new(kv);
        assert_eq!(reopened.latest(QUEUE), None);
        let loaded = reopened.load(QUEUE).unwrap().unwrap();
        assert_eq!(loaded, snapshot(7));
        assert_eq!(reopened.latest(QUEUE).unwrap().log_offset, 7);
    }

    #[test]
    fn test_older_snapshot_never_overwrites_newer() {
        let kv = Arc::new(MemoryKvStore::new());
        let service = SnapshotService::new(kv);
        assert!(service.persist(&snapshot(9)).unwrap());
        assert!(!service.persist(&snapshot(5)).unwrap());
        assert_eq!(service.load(QUEUE).unwrap().unwrap().log_offset, 9);
    }

    #[test]
    fn test_failed_persist_keeps_previous_mark() {
        let kv = Arc::new(MemoryKvStore::new());
        let service = SnapshotService::new(kv.clone());
        service.persist(&snapshot(4)).unwrap();
        kv.fail_next_puts(1);
        assert!(service.persist(&snapshot(8)).is_err());
        assert_eq!(service.latest(QUEUE).unwrap().log_offset, 4);
    }

    #[test]
    fn test_snapshot_for_other_queue_is_corrupt() {
        let kv = Arc::new(MemoryKvStore::new());
        let data = snapshot(1).encode().unwrap();
        kv.put(SNAPSHOT_NAMESPACE, &QueueId::new(9, 9).kv_key(), &data)
            .unwrap();
        let service = SnapshotService::new(kv);
        assert!(matches!(
            service.load(QueueId::new(9, 9)),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn test_planner_triggers() {
        let policy = SnapshotPolicy {
            interval_ms: Some(1_000),
            min_operations: Some(3),
        };
        let mut planner = SnapshotPlanner::new(policy);
        assert!(!planner.should_snapshot(0));
        planner.observe(1);
        assert!(planner.should_snapshot(0));
        planner.mark_snapshot(0, 1);

        planner.observe(2);
        assert!(!planner.should_snapshot(500));
        planner.observe(1);
        assert!(planner.should_snapshot(500));
        planner.mark_snapshot(500, 3);
        planner.observe(1);
        assert!(!planner.should_snapshot(1_499));
        assert!(planner.should_snapshot(1_500));
    }
}
