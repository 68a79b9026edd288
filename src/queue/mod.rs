//! Logic queue manager: the pop/ack state machine of every queue.
//!
//! Each queue is an actor made of one mutex over its [`QueueState`]. Every
//! mutating call holds that lock across its operation log append, so the log
//! order of a queue is the order its calls took effect. Different queues never
//! share a lock on the hot path.
//!
//! A mutation is committed in a fixed order: build the operation, append it
//! durably, apply it in memory, then reconcile timers. A failed append leaves
//! memory untouched; a crash after the append is repaired by replay.

mod state;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::config::StoreConfig;
use crate::inflight::{InflightEntry, InflightState};
use crate::message::{encode_message, Message, QueueId, Receipt, ReceiptHandle};
use crate::metadata::{MetadataService, QueueConfig};
use crate::notifier::{MessageArrivalNotifier, WaitOutcome};
use crate::oplog::{Operation, OperationKind, OperationLog};
use crate::snapshot::{Snapshot, SnapshotService};
use crate::storage::StreamStore;
use crate::sync::{lock, read, write};
use crate::timer::{TimerEntry, TimerPayload, TimerWheel};
use crate::{Error, Result};

use state::{QueueState, QueueStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    Ok,
    NotFound,
    /// The handle was valid once but its delivery already ended.
    AlreadyProcessed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeInvisibleStatus {
    Ok,
    NotFound,
}

/// What a fired timer turned into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expiry {
    /// Nothing to do: acked, rescheduled, or fired twice.
    Discarded,
    /// The message went back to the ready set under a new receipt.
    Retried { receipt_id: u64, attempts: u32 },
    /// Retry budget exhausted; the caller must send `message` and then
    /// complete or defer the dead-letter.
    DeadLetter { receipt_id: u64, message: Message },
    /// A delayed message at the queue head became deliverable.
    Released,
    /// A retry is still waiting in the ready set; its timer was re-armed.
    Pending,
    /// The timer fired before the consumer's window closed (as recovery arms
    /// them); it was moved to the end of the window without charging an
    /// attempt.
    Rescheduled { expire_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub queue: QueueId,
    pub online: bool,
    pub consume_offset: u64,
    pub min_unacked_offset: u64,
    pub inflight: usize,
    pub ready: usize,
    pub next_log_offset: u64,
    pub operations_since_snapshot: u64,
}

struct LogicQueue {
    state: Mutex<QueueState>,
    /// Serializes snapshot capture + persist for this queue.
    snapshot_lock: Mutex<()>,
}

pub struct LogicQueueManager {
    config: StoreConfig,
    clock: Arc<dyn Clock>,
    streams: Arc<dyn StreamStore>,
    metadata: Arc<dyn MetadataService>,
    oplog: OperationLog,
    snapshots: Arc<SnapshotService>,
    timers: Arc<TimerWheel>,
    notifier: Arc<MessageArrivalNotifier>,
    queues: RwLock<HashMap<QueueId, Arc<LogicQueue>>>,
    open_lock: Mutex<()>,
    closed: AtomicBool,
}

impl LogicQueueManager {
    pub fn new(
        config: StoreConfig,
        clock: Arc<dyn Clock>,
        streams: Arc<dyn StreamStore>,
        metadata: Arc<dyn MetadataService>,
        snapshots: Arc<SnapshotService>,
        timers: Arc<TimerWheel>,
        notifier: Arc<MessageArrivalNotifier>,
    ) -> Self {
        let oplog = OperationLog::new(Arc::clone(&streams), config.append_retry, config.fetch_batch);
        Self {
            config,
            clock,
            streams,
            metadata,
            oplog,
            snapshots,
            timers,
            notifier,
            queues: RwLock::new(HashMap::new()),
            open_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Loads a queue, recovering it from its snapshot and operation log.
    pub fn open_queue(&self, queue: QueueId) -> Result<()> {
        self.queue(queue).map(|_| ())
    }

    pub fn open_queues(&self) -> Vec<QueueId> {
        let mut queues: Vec<_> = read(&self.queues).keys().copied().collect();
        queues.sort_unstable();
        queues
    }

    /// Delivers up to `batch_size` messages, hiding each for `invisible`.
    ///
    /// Retried messages go first, then new ones from the consume offset. With
    /// nothing deliverable the call waits up to `max_wait` for an arrival
    /// before failing with `Error::Timeout`.
    pub fn pop(
        &self,
        queue: QueueId,
        batch_size: usize,
        invisible: Duration,
        max_wait: Duration,
    ) -> Result<Vec<Receipt>> {
        if batch_size == 0 {
            return Err(Error::InvalidArgument("batch size must be positive"));
        }
        if invisible.is_zero() {
            return Err(Error::InvalidArgument("invisible duration must be positive"));
        }
        let batch = batch_size.min(self.config.max_pop_batch);
        let invisible_ms = duration_ms(invisible);
        let logic = self.queue(queue)?;
        // A budget too large to represent as an instant means no deadline.
        let deadline = Instant::now().checked_add(max_wait);

        loop {
            self.ensure_open()?;
            let seen = self.notifier.generation(queue);
            let receipts = self.try_pop(&logic, batch, invisible_ms)?;
            if !receipts.is_empty() {
                self.maybe_snapshot(&logic);
                return Ok(receipts);
            }
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout(max_wait));
                    }
                    deadline - now
                }
                None => max_wait,
            };
            if self.notifier.wait(queue, seen, remaining) == WaitOutcome::Closed {
                return Err(Error::Shutdown);
            }
        }
    }

    pub fn ack(&self, queue: QueueId, handle: &ReceiptHandle) -> Result<AckStatus> {
        if handle.queue != queue {
            return Ok(AckStatus::NotFound);
        }
        let logic = self.queue(queue)?;
        let status = {
            let mut state = lock(&logic.state);
            state.ensure_online()?;
            match state.inflight.get(handle.receipt_id).cloned() {
                Some(entry) if is_delivery_of(&entry, handle) => {
                    let op = Operation::ack(entry.offset, entry.receipt_id, self.clock.now_ms());
                    self.commit(&mut state, &op)?;
                    log::debug!("queue {queue}: acked offset {}", handle.offset);
                    AckStatus::Ok
                }
                Some(_) => AckStatus::NotFound,
                None => ended_delivery_status(&state, handle),
            }
        };
        if status == AckStatus::Ok {
            self.maybe_snapshot(&logic);
        }
        Ok(status)
    }

    /// Moves the end of a delivery's visibility window to `now + duration`.
    /// The attempt count is unchanged.
    pub fn change_invisible_duration(
        &self,
        queue: QueueId,
        handle: &ReceiptHandle,
        duration: Duration,
    ) -> Result<ChangeInvisibleStatus> {
        if handle.queue != queue {
            return Ok(ChangeInvisibleStatus::NotFound);
        }
        let logic = self.queue(queue)?;
        let status = {
            let mut state = lock(&logic.state);
            state.ensure_online()?;
            match state.inflight.get(handle.receipt_id).cloned() {
                Some(entry)
                    if is_delivery_of(&entry, handle)
                        && !state.dead_lettering.contains(&handle.receipt_id) =>
                {
                    let now = self.clock.now_ms();
                    let op = Operation::change_invisible(
                        entry.offset,
                        entry.receipt_id,
                        now,
                        now.saturating_add(duration_ms(duration)),
                    );
                    self.commit(&mut state, &op)?;
                    ChangeInvisibleStatus::Ok
                }
                _ => ChangeInvisibleStatus::NotFound,
            }
        };
        if status == ChangeInvisibleStatus::Ok {
            self.maybe_snapshot(&logic);
        }
        Ok(status)
    }

    /// Appends one message to the queue's data stream and wakes every queue
    /// consuming that stream.
    pub fn put(&self, queue: QueueId, payload: &[u8], delay_until_ms: Option<u64>) -> Result<u64> {
        self.ensure_open()?;
        let config = self.metadata.queue_config(queue)?;
        let record = encode_message(self.clock.now_ms(), delay_until_ms, payload)?;
        let offset = self.streams.append(config.data_stream, &record)?;
        for other in self.metadata.queues() {
            if other == queue {
                self.notifier.notify(other);
            } else if let Ok(other_config) = self.metadata.queue_config(other) {
                if other_config.data_stream == config.data_stream {
                    self.notifier.notify(other);
                }
            }
        }
        Ok(offset)
    }

    pub fn stats(&self, queue: QueueId) -> Result<QueueStats> {
        let logic = self.queue(queue)?;
        let state = lock(&logic.state);
        Ok(QueueStats {
            queue,
            online: state.status == QueueStatus::Online,
            consume_offset: state.consume_offset,
            min_unacked_offset: state.min_unacked_offset(),
            inflight: state.inflight.len(),
            ready: state.inflight.ready_len(),
            next_log_offset: state.next_log_offset,
            operations_since_snapshot: state.planner.operations_since(),
        })
    }

    /// Point-in-time copy of the queue's inflight set in offset order.
    pub fn inflight(&self, queue: QueueId) -> Result<Vec<InflightEntry>> {
        let logic = self.queue(queue)?;
        let entries = lock(&logic.state).inflight.entries();
        Ok(entries)
    }

    /// Live min-unacked offset of a loaded queue; `None` if it is not loaded.
    pub fn live_min_unacked(&self, queue: QueueId) -> Option<u64> {
        let logic = read(&self.queues).get(&queue).cloned()?;
        let state = lock(&logic.state);
        match state.status {
            QueueStatus::Online => Some(state.min_unacked_offset()),
            QueueStatus::Offline(_) => None,
        }
    }

    /// Captures and persists a snapshot of `queue` now.
    ///
    /// Returns `None` when the queue is offline or a newer snapshot is already
    /// durable.
    pub fn snapshot(&self, queue: QueueId) -> Result<Option<Snapshot>> {
        let logic = self.queue(queue)?;
        self.snapshot_queue(&logic)
    }

    /// Snapshots every loaded queue whose policy says it is due.
    pub fn snapshot_due(&self) -> usize {
        let queues: Vec<_> = read(&self.queues).values().cloned().collect();
        let mut taken = 0;
        for logic in queues {
            if self.is_snapshot_due(&logic) && self.try_snapshot(&logic) {
                taken += 1;
            }
        }
        taken
    }

    /// Resolves a fired timer against the current queue state.
    pub fn expire(&self, entry: &TimerEntry) -> Result<Expiry> {
        let Some(logic) = read(&self.queues).get(&entry.queue).cloned() else {
            return Ok(Expiry::Discarded);
        };
        let mut state = lock(&logic.state);
        if state.status != QueueStatus::Online {
            return Ok(Expiry::Discarded);
        }

        let receipt_id = match entry.payload {
            TimerPayload::Delayed { offset } => {
                return Ok(if state.delay_timer == Some((offset, entry.id)) {
                    state.delay_timer = None;
                    Expiry::Released
                } else {
                    Expiry::Discarded
                });
            }
            TimerPayload::Inflight { receipt_id } => receipt_id,
        };

        let Some(current) = state.inflight.get(receipt_id).cloned() else {
            return Ok(Expiry::Discarded);
        };
        if state.inflight.timer(receipt_id) != Some(entry.id)
            || state.dead_lettering.contains(&receipt_id)
        {
            return Ok(Expiry::Discarded);
        }

        let now = self.clock.now_ms();
        if current.state == InflightState::Delivered && now < current.invisible_until_ms {
            let expire_ms = current.invisible_until_ms;
            self.arm(&mut state, receipt_id, expire_ms);
            return Ok(Expiry::Rescheduled { expire_ms });
        }
        let window = current
            .invisible_until_ms
            .saturating_sub(current.pop_ms)
            .max(1);
        if current.state == InflightState::Ready {
            // Nobody picked the retry up yet; wake pops again without
            // charging another attempt.
            self.arm(&mut state, receipt_id, now.saturating_add(window));
            return Ok(Expiry::Pending);
        }

        let attempts = current.attempts + 1;
        if attempts <= state.config.max_retries {
            let new_receipt = state.next_receipt_id;
            let op = Operation::timeout(
                current.offset,
                receipt_id,
                new_receipt,
                attempts,
                now,
                now.saturating_add(window),
            );
            self.commit(&mut state, &op)?;
            log::debug!(
                "queue {}: offset {} expired, retry {attempts}/{}",
                entry.queue,
                current.offset,
                state.config.max_retries
            );
            drop(state);
            self.maybe_snapshot(&logic);
            return Ok(Expiry::Retried {
                receipt_id: new_receipt,
                attempts,
            });
        }

        let mut message = self.read_message(&mut state, current.offset)?;
        message.attempts = attempts;
        state.dead_lettering.insert(receipt_id);
        Ok(Expiry::DeadLetter {
            receipt_id,
            message,
        })
    }

    /// Records a successful dead-letter send and retires the delivery.
    /// Returns false if the delivery ended some other way meanwhile.
    pub fn complete_dead_letter(&self, queue: QueueId, receipt_id: u64, attempts: u32) -> Result<bool> {
        let logic = self.queue(queue)?;
        let completed = {
            let mut state = lock(&logic.state);
            state.ensure_online()?;
            state.dead_lettering.remove(&receipt_id);
            let Some(offset) = state.inflight.get(receipt_id).map(|entry| entry.offset) else {
                return Ok(false);
            };
            let op = Operation::dead_letter(offset, receipt_id, attempts, self.clock.now_ms());
            self.commit(&mut state, &op)?;
            log::info!("queue {queue}: dead-lettered offset {offset} after {attempts} attempts");
            true
        };
        self.maybe_snapshot(&logic);
        Ok(completed)
    }

    /// Re-arms a delivery whose dead-letter send failed, with backoff.
    /// Returns the new expiry, or `None` if the delivery is gone.
    pub fn defer_dead_letter(&self, queue: QueueId, receipt_id: u64) -> Result<Option<u64>> {
        let logic = self.queue(queue)?;
        let mut state = lock(&logic.state);
        state.dead_lettering.remove(&receipt_id);
        if state.inflight.get(receipt_id).is_none() {
            return Ok(None);
        }
        let failures = {
            let failures = state.dead_letter_failures.entry(receipt_id).or_insert(0);
            *failures += 1;
            *failures
        };
        let delay = self.config.revive.dead_letter_retry.backoff(failures);
        let expire_ms = self.clock.now_ms().saturating_add(duration_ms(delay));
        self.arm(&mut state, receipt_id, expire_ms);
        log::warn!(
            "queue {queue}: dead-letter send failed {failures} times for receipt {receipt_id}, retry in {delay:?}"
        );
        Ok(Some(expire_ms))
    }

    /// Puts a fired timer back after its handling failed, so the delivery is
    /// revisited after `delay`. Returns false if the timer went stale meanwhile.
    pub fn rearm_expiry(&self, entry: &TimerEntry, delay: Duration) -> Result<bool> {
        let Some(logic) = read(&self.queues).get(&entry.queue).cloned() else {
            return Ok(false);
        };
        let mut state = lock(&logic.state);
        let expire_ms = self.clock.now_ms().saturating_add(duration_ms(delay));
        match entry.payload {
            TimerPayload::Inflight { receipt_id } => {
                if state.inflight.timer(receipt_id) != Some(entry.id) {
                    return Ok(false);
                }
                state.dead_lettering.remove(&receipt_id);
                self.arm(&mut state, receipt_id, expire_ms);
            }
            TimerPayload::Delayed { offset } => {
                if state.delay_timer != Some((offset, entry.id)) {
                    return Ok(false);
                }
                state.delay_timer = None;
                self.arm_delay(&mut state, offset, expire_ms);
            }
        }
        Ok(true)
    }

    /// Stops accepting calls and releases blocked pops.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notifier.close();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::Shutdown)
        } else {
            Ok(())
        }
    }

    fn queue(&self, queue: QueueId) -> Result<Arc<LogicQueue>> {
        self.ensure_open()?;
        if let Some(logic) = read(&self.queues).get(&queue) {
            return Ok(Arc::clone(logic));
        }

        let _opening = lock(&self.open_lock);
        if let Some(logic) = read(&self.queues).get(&queue) {
            return Ok(Arc::clone(logic));
        }
        let config = self.metadata.queue_config(queue)?;
        let (state, outcome) = match self.recover(config) {
            Ok(state) => (state, Ok(())),
            Err(Error::Corrupt(reason)) => {
                log::error!("queue {queue} is corrupt and taken offline: {reason}");
                let mut state = QueueState::new(config, 0, 0, self.config.snapshot);
                state.status = QueueStatus::Offline(reason.clone());
                (state, Err(Error::Corrupt(reason)))
            }
            Err(err) => return Err(err),
        };
        let logic = Arc::new(LogicQueue {
            state: Mutex::new(state),
            snapshot_lock: Mutex::new(()),
        });
        write(&self.queues).insert(queue, Arc::clone(&logic));
        outcome.map(|()| logic)
    }

    fn recover(&self, config: QueueConfig) -> Result<QueueState> {
        let queue = config.queue;
        let data_start = self.streams.start_offset(config.data_stream)?;
        let data_end = self.streams.next_offset(config.data_stream)?;
        let snapshot = self.snapshots.load(queue)?;
        if let Some(snapshot) = &snapshot {
            let log_end = self.oplog.next_offset(config.operation_stream)?;
            check_snapshot(snapshot, data_end, log_end)?;
        }

        let mut state = match snapshot {
            Some(snapshot) => QueueState::from_snapshot(config, snapshot, self.config.snapshot),
            None => {
                let log_start = self.oplog.start_offset(config.operation_stream)?;
                QueueState::new(config, data_start, log_start, self.config.snapshot)
            }
        };

        let replay = match self.oplog.replay(config.operation_stream, state.next_log_offset) {
            Ok(replay) => replay,
            Err(Error::Trimmed { stream, offset }) => {
                return Err(Error::Corrupt(format!(
                    "operation log {stream} trimmed past replay start {offset}"
                )))
            }
            Err(err) => return Err(err),
        };
        let mut replayed = 0u64;
        for entry in replay {
            let entry = entry?;
            let op = entry.op;
            let creates = matches!(op.kind, OperationKind::Pop | OperationKind::Timeout);
            if creates && op.message_offset >= data_end {
                return Err(Error::Corrupt(format!(
                    "operation log offset {} references message {} but the data stream ends at {data_end}",
                    entry.log_offset, op.message_offset
                )));
            }
            state.apply(&op);
            state.next_log_offset = entry.log_offset + 1;
            replayed += 1;
        }
        if state.min_unacked_offset() < data_start && !state.inflight.is_empty() {
            return Err(Error::Corrupt(format!(
                "data stream trimmed to {data_start} past unacked offset {}",
                state.min_unacked_offset()
            )));
        }
        state.consume_offset = state.consume_offset.max(data_start);
        state.planner.observe(replayed);

        let now = self.clock.now_ms();
        let residual = self.config.recovery_rearm_delay_ms;
        for receipt_id in state.inflight.unarmed() {
            let Some(entry) = state.inflight.get(receipt_id) else {
                continue;
            };
            let expire_ms = entry.invisible_until_ms.min(now.saturating_add(residual));
            self.arm(&mut state, receipt_id, expire_ms);
        }

        log::info!(
            "recovered queue {queue}: consume_offset={} min_unacked={} inflight={} replayed={replayed}",
            state.consume_offset,
            state.min_unacked_offset(),
            state.inflight.len()
        );
        Ok(state)
    }

    fn try_pop(&self, logic: &LogicQueue, batch: usize, invisible_ms: u64) -> Result<Vec<Receipt>> {
        let mut state = lock(&logic.state);
        state.ensure_online()?;
        let queue = state.config.queue;
        let now = self.clock.now_ms();
        let invisible_until_ms = now.saturating_add(invisible_ms);
        let mut receipts = Vec::new();

        while receipts.len() < batch {
            let Some(ready) = state.inflight.next_ready().cloned() else {
                break;
            };
            let message = match self.read_message(&mut state, ready.offset) {
                Ok(message) => message,
                Err(err) => return partial(receipts, err),
            };
            let receipt_id = state.next_receipt_id;
            let op = Operation::pop(
                ready.offset,
                receipt_id,
                Some(ready.receipt_id),
                ready.attempts,
                now,
                invisible_until_ms,
            );
            if let Err(err) = self.commit(&mut state, &op) {
                return partial(receipts, err);
            }
            receipts.push(receipt(queue, receipt_id, message, ready.attempts, invisible_until_ms));
        }

        if receipts.len() < batch {
            let want = batch - receipts.len();
            let records = match self
                .streams
                .fetch(state.config.data_stream, state.consume_offset, want)
            {
                Ok(records) => records,
                Err(err) => return partial(receipts, err),
            };
            for record in records {
                let message = match Message::decode(queue, record.offset, &record.payload) {
                    Ok(message) => message,
                    Err(err) => return partial(receipts, self.take_offline(&mut state, err)),
                };
                if let Some(until) = message.delay_until_ms.filter(|until| *until > now) {
                    self.arm_delay(&mut state, record.offset, until);
                    break;
                }
                let receipt_id = state.next_receipt_id;
                let op = Operation::pop(record.offset, receipt_id, None, 0, now, invisible_until_ms);
                if let Err(err) = self.commit(&mut state, &op) {
                    return partial(receipts, err);
                }
                receipts.push(receipt(queue, receipt_id, message, 0, invisible_until_ms));
            }
        }

        if !receipts.is_empty() {
            log::debug!(
                "queue {queue}: popped {} messages, consume_offset={}",
                receipts.len(),
                state.consume_offset
            );
        }
        Ok(receipts)
    }

    /// Appends `op`, applies it, and reconciles timers. Memory is only touched
    /// once the append is durable.
    fn commit(&self, state: &mut QueueState, op: &Operation) -> Result<()> {
        let log_offset = self.oplog.append(state.config.operation_stream, op)?;
        if log_offset < state.next_log_offset {
            log::warn!(
                "queue {}: operation log went backwards ({} < {})",
                state.config.queue,
                log_offset,
                state.next_log_offset
            );
        }
        state.next_log_offset = log_offset + 1;
        state.planner.observe(1);

        for timer in state.apply(op) {
            self.timers.cancel(timer);
        }
        if matches!(
            op.kind,
            OperationKind::Pop | OperationKind::Timeout | OperationKind::ChangeInvisible
        ) {
            self.arm(state, op.receipt_id, op.invisible_until_ms);
        }
        Ok(())
    }

    /// Gives a live delivery a fresh timer, cancelling the one it had.
    fn arm(&self, state: &mut QueueState, receipt_id: u64, expire_ms: u64) {
        if state.inflight.get(receipt_id).is_none() {
            return;
        }
        let timer = self.timers.schedule(
            state.config.queue,
            expire_ms,
            TimerPayload::Inflight { receipt_id },
        );
        if let Some(previous) = state.inflight.attach_timer(receipt_id, timer) {
            self.timers.cancel(previous);
        }
    }

    fn arm_delay(&self, state: &mut QueueState, offset: u64, until_ms: u64) {
        if matches!(state.delay_timer, Some((armed, _)) if armed == offset) {
            return;
        }
        if let Some((_, previous)) = state.delay_timer.take() {
            self.timers.cancel(previous);
        }
        let timer = self
            .timers
            .schedule(state.config.queue, until_ms, TimerPayload::Delayed { offset });
        state.delay_timer = Some((offset, timer));
    }

    fn read_message(&self, state: &mut QueueState, offset: u64) -> Result<Message> {
        let queue = state.config.queue;
        let records = self.streams.fetch(state.config.data_stream, offset, 1)?;
        let Some(record) = records.into_iter().next() else {
            let err = Error::Corrupt(format!("message {offset} of queue {queue} was never appended"));
            return Err(self.take_offline(state, err));
        };
        Message::decode(queue, offset, &record.payload).map_err(|err| self.take_offline(state, err))
    }

    fn take_offline(&self, state: &mut QueueState, err: Error) -> Error {
        if let Error::Corrupt(reason) = &err {
            log::error!(
                "queue {} is corrupt and taken offline: {reason}",
                state.config.queue
            );
            state.status = QueueStatus::Offline(reason.clone());
        }
        err
    }

    fn is_snapshot_due(&self, logic: &LogicQueue) -> bool {
        let state = lock(&logic.state);
        state.status == QueueStatus::Online && state.planner.should_snapshot(self.clock.now_ms())
    }

    fn maybe_snapshot(&self, logic: &LogicQueue) {
        if self.is_snapshot_due(logic) {
            self.try_snapshot(logic);
        }
    }

    fn try_snapshot(&self, logic: &LogicQueue) -> bool {
        match self.snapshot_queue(logic) {
            Ok(taken) => taken.is_some(),
            Err(err) => {
                log::warn!("snapshot failed, recovery will replay further: {err}");
                false
            }
        }
    }

    fn snapshot_queue(&self, logic: &LogicQueue) -> Result<Option<Snapshot>> {
        let _serial = lock(&logic.snapshot_lock);
        let now = self.clock.now_ms();
        let (snapshot, covered) = {
            let state = lock(&logic.state);
            if state.status != QueueStatus::Online {
                return Ok(None);
            }
            (state.capture(now), state.planner.operations_since())
        };
        let written = self.snapshots.persist(&snapshot)?;
        lock(&logic.state).planner.mark_snapshot(now, covered);
        Ok(written.then_some(snapshot))
    }
}

fn is_delivery_of(entry: &InflightEntry, handle: &ReceiptHandle) -> bool {
    entry.offset == handle.offset && entry.state == InflightState::Delivered
}

/// Status of a handle whose receipt is no longer live.
///
/// While the offset is still inflight, only an earlier receipt can have been
/// one of its deliveries. Once the offset is retired, per-offset receipt
/// history is gone; a receipt below the allocator watermark for a consumed
/// offset is then taken as one that was handed out.
fn ended_delivery_status(state: &QueueState, handle: &ReceiptHandle) -> AckStatus {
    let issued = match state.inflight.receipt_for_offset(handle.offset) {
        Some(live) => handle.receipt_id < live,
        None => handle.receipt_id < state.next_receipt_id && handle.offset < state.consume_offset,
    };
    if issued {
        AckStatus::AlreadyProcessed
    } else {
        AckStatus::NotFound
    }
}

/// A snapshot may lag the streams but never lead them.
fn check_snapshot(snapshot: &Snapshot, data_end: u64, log_end: u64) -> Result<()> {
    let queue = snapshot.queue;
    if snapshot.log_offset > log_end {
        return Err(Error::Corrupt(format!(
            "snapshot of queue {queue} covers operation log up to {} but the log ends at {log_end}",
            snapshot.log_offset
        )));
    }
    if snapshot.consume_offset > data_end {
        return Err(Error::Corrupt(format!(
            "snapshot of queue {queue} consumed up to {} but the data stream ends at {data_end}",
            snapshot.consume_offset
        )));
    }
    if let Some(entry) = snapshot.inflight.iter().find(|entry| entry.offset >= data_end) {
        return Err(Error::Corrupt(format!(
            "snapshot of queue {queue} holds message {} but the data stream ends at {data_end}",
            entry.offset
        )));
    }
    Ok(())
}

fn receipt(
    queue: QueueId,
    receipt_id: u64,
    mut message: Message,
    attempts: u32,
    invisible_until_ms: u64,
) -> Receipt {
    message.attempts = attempts;
    Receipt {
        handle: ReceiptHandle {
            queue,
            offset: message.offset,
            receipt_id,
        },
        message,
        invisible_until_ms,
    }
}

/// Returns what was already committed, or the error if nothing was.
fn partial(receipts: Vec<Receipt>, err: Error) -> Result<Vec<Receipt>> {
    if receipts.is_empty() {
        Err(err)
    } else {
        log::warn!("pop stopped after {} messages: {err}", receipts.len());
        Ok(receipts)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
