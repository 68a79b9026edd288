use std::collections::{HashMap, HashSet};

use crate::config::SnapshotPolicy;
use crate::inflight::{InflightEntry, InflightState, InflightTracker};
use crate::metadata::QueueConfig;
use crate::oplog::{Operation, OperationKind};
use crate::snapshot::{Snapshot, SnapshotPlanner, SNAPSHOT_VERSION};
use crate::timer::TimerId;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum QueueStatus {
    Online,
    /// Taken offline after corruption; needs operator intervention.
    Offline(String),
}

/// Mutable state of one queue. Only touched while holding the queue's lock.
pub(crate) struct QueueState {
    pub config: QueueConfig,
    pub status: QueueStatus,
    pub consume_offset: u64,
    pub next_receipt_id: u64,
    /// Offset the next operation log record is expected to land at.
    pub next_log_offset: u64,
    pub inflight: InflightTracker,
    pub planner: SnapshotPlanner,
    /// Pending release timer for a delayed message blocking the queue head.
    pub delay_timer: Option<(u64, TimerId)>,
    /// Receipts whose dead-letter send is in progress outside the lock.
    pub dead_lettering: HashSet<u64>,
    pub dead_letter_failures: HashMap<u64, u32>,
}

impl QueueState {
    pub fn new(config: QueueConfig, consume_offset: u64, log_offset: u64, policy: SnapshotPolicy) -> Self {
        Self {
            config,
            status: QueueStatus::Online,
            consume_offset,
            next_receipt_id: 0,
            next_log_offset: log_offset,
            inflight: InflightTracker::new(),
            planner: SnapshotPlanner::new(policy),
            delay_timer: None,
            dead_lettering: HashSet::new(),
            dead_letter_failures: HashMap::new(),
        }
    }

    pub fn from_snapshot(config: QueueConfig, snapshot: Snapshot, policy: SnapshotPolicy) -> Self {
        let mut state = Self::new(config, snapshot.consume_offset, snapshot.log_offset, policy);
        state.next_receipt_id = snapshot.next_receipt_id;
        state.inflight = InflightTracker::from_entries(snapshot.inflight);
        state
    }

    pub fn min_unacked_offset(&self) -> u64 {
        self.inflight.min_offset().unwrap_or(self.consume_offset)
    }

    pub fn ensure_online(&self) -> Result<()> {
        match &self.status {
            QueueStatus::Online => Ok(()),
            QueueStatus::Offline(_) => Err(Error::QueueOffline(self.config.queue)),
        }
    }

    pub fn capture(&self, now_ms: u64) -> Snapshot {
        Snapshot {
            version: SNAPSHOT_VERSION,
            queue: self.config.queue,
            consume_offset: self.consume_offset,
            min_unacked_offset: self.min_unacked_offset(),
            next_receipt_id: self.next_receipt_id,
            log_offset: self.next_log_offset,
            taken_at_ms: now_ms,
            inflight: self.inflight.entries(),
        }
    }

    /// Applies a durable operation to the in-memory state and returns the
    /// timers of deliveries it retired.
    ///
    /// Live operations and replayed ones go through this same path, and it is
    /// idempotent per record, so a record appended twice after an ambiguous
    /// store failure replays harmlessly.
    pub fn apply(&mut self, op: &Operation) -> Vec<TimerId> {
        let mut retired = Vec::new();
        let mut retire = |found: Option<(InflightEntry, Option<TimerId>)>| {
            if let Some((_, Some(timer))) = found {
                retired.push(timer);
            }
        };

        match op.kind {
            OperationKind::Pop | OperationKind::Timeout => {
                if let Some(old) = op.supersedes {
                    retire(self.inflight.remove(old));
                }
                let state = if op.kind == OperationKind::Pop {
                    InflightState::Delivered
                } else {
                    InflightState::Ready
                };
                retire(self.inflight.insert(InflightEntry {
                    receipt_id: op.receipt_id,
                    offset: op.message_offset,
                    pop_ms: op.timestamp_ms,
                    invisible_until_ms: op.invisible_until_ms,
                    attempts: op.attempts,
                    state,
                }));
                if op.kind == OperationKind::Pop && op.supersedes.is_none() {
                    self.consume_offset = self.consume_offset.max(op.message_offset + 1);
                }
                self.next_receipt_id = self.next_receipt_id.max(op.receipt_id + 1);
            }
            OperationKind::Ack | OperationKind::DeadLetter => {
                retire(self.inflight.remove(op.receipt_id));
                self.dead_lettering.remove(&op.receipt_id);
                self.dead_letter_failures.remove(&op.receipt_id);
            }
            OperationKind::ChangeInvisible => {
                self.inflight
                    .set_invisible_until(op.receipt_id, op.invisible_until_ms);
            }
        }
        retired
    }
}
