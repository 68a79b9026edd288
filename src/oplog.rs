//! Per-queue operation log.
//!
//! Every state transition of a queue is appended to the queue's operation
//! stream before it is applied in memory. Replaying the log on top of the
//! latest snapshot reproduces the queue's inflight set exactly.
//!
//! # Record layout
//!
//! ```text
//! 0..2    magic (0x504F)
//! 2       kind
//! 3       version
//! 4..8    attempts
//! 8..16   message offset
//! 16..24  receipt id
//! 24..32  superseded receipt id (u64::MAX = none)
//! 32..40  timestamp (ms)
//! 40..48  invisible until (ms)
//! 48..52  crc32 of bytes 0..48
//! 52..56  reserved
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;

use crate::config::RetryPolicy;
use crate::message::{read_u16, read_u32, read_u64, StreamId};
use crate::storage::{StreamRecord, StreamStore};
use crate::{Error, Result};

pub const OPERATION_MAGIC: u16 = 0x504F; // 'PO'
pub const OPERATION_VERSION: u8 = 1;
pub const OPERATION_RECORD_SIZE: usize = 56;

const CHECKSUMMED_LEN: usize = 48;
const NO_RECEIPT: u64 = u64::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OperationKind {
    Pop = 1,
    Ack = 2,
    Timeout = 3,
    DeadLetter = 4,
    ChangeInvisible = 5,
}

impl OperationKind {
    fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Pop,
            2 => Self::Ack,
            3 => Self::Timeout,
            4 => Self::DeadLetter,
            5 => Self::ChangeInvisible,
            _ => return None,
        })
    }

    /// Whether the operation ends the life of the receipt it names.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ack | Self::DeadLetter)
    }
}

/// One state transition of one delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Operation {
    pub kind: OperationKind,
    pub message_offset: u64,
    pub receipt_id: u64,
    /// Receipt retired by this operation: the expired delivery of a TIMEOUT,
    /// or the ready entry a POP hands out again.
    pub supersedes: Option<u64>,
    pub attempts: u32,
    pub timestamp_ms: u64,
    pub invisible_until_ms: u64,
}

impl Operation {
    pub fn pop(
        message_offset: u64,
        receipt_id: u64,
        supersedes: Option<u64>,
        attempts: u32,
        now_ms: u64,
        invisible_until_ms: u64,
    ) -> Self {
        Self {
            kind: OperationKind::Pop,
            message_offset,
            receipt_id,
            supersedes,
            attempts,
            timestamp_ms: now_ms,
            invisible_until_ms,
        }
    }

    pub fn ack(message_offset: u64, receipt_id: u64, now_ms: u64) -> Self {
        Self::terminal(OperationKind::Ack, message_offset, receipt_id, 0, now_ms)
    }

    pub fn dead_letter(message_offset: u64, receipt_id: u64, attempts: u32, now_ms: u64) -> Self {
        Self::terminal(OperationKind::DeadLetter, message_offset, receipt_id, attempts, now_ms)
    }

    pub fn timeout(
        message_offset: u64,
        expired_receipt: u64,
        receipt_id: u64,
        attempts: u32,
        now_ms: u64,
        invisible_until_ms: u64,
    ) -> Self {
        Self {
            kind: OperationKind::Timeout,
            message_offset,
            receipt_id,
            supersedes: Some(expired_receipt),
            attempts,
            timestamp_ms: now_ms,
            invisible_until_ms,
        }
    }

    pub fn change_invisible(
        message_offset: u64,
        receipt_id: u64,
        now_ms: u64,
        invisible_until_ms: u64,
    ) -> Self {
        Self {
            kind: OperationKind::ChangeInvisible,
            message_offset,
            receipt_id,
            supersedes: None,
            attempts: 0,
            timestamp_ms: now_ms,
            invisible_until_ms,
        }
    }

    fn terminal(kind: OperationKind, message_offset: u64, receipt_id: u64, attempts: u32, now_ms: u64) -> Self {
        Self {
            kind,
            message_offset,
            receipt_id,
            supersedes: None,
            attempts,
            timestamp_ms: now_ms,
            invisible_until_ms: 0,
        }
    }

    pub fn encode(&self) -> [u8; OPERATION_RECORD_SIZE] {
        let mut buf = [0u8; OPERATION_RECORD_SIZE];
        buf[0..2].copy_from_slice(&OPERATION_MAGIC.to_le_bytes());
        buf[2] = self.kind as u8;
        buf[3] = OPERATION_VERSION;
        buf[4..8].copy_from_slice(&self.attempts.to_le_bytes());
        buf[8..16].copy_from_slice(&self.message_offset.to_le_bytes());
        buf[16..24].copy_from_slice(&self.receipt_id.to_le_bytes());
        buf[24..32].copy_from_slice(&self.supersedes.unwrap_or(NO_RECEIPT).to_le_bytes());
        buf[32..40].copy_from_slice(&self.timestamp_ms.to_le_bytes());
        buf[40..48].copy_from_slice(&self.invisible_until_ms.to_le_bytes());
        let checksum = crc32fast::hash(&buf[..CHECKSUMMED_LEN]);
        buf[48..52].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, &'static str> {
        if bytes.len() != OPERATION_RECORD_SIZE {
            return Err("operation record has wrong size");
        }
        if read_u16(bytes, 0) != OPERATION_MAGIC {
            return Err("operation record magic mismatch");
        }
        if crc32fast::hash(&bytes[..CHECKSUMMED_LEN]) != read_u32(bytes, 48) {
            return Err("operation record checksum mismatch");
        }
        if bytes[3] != OPERATION_VERSION {
            return Err("unsupported operation record version");
        }
        let kind = OperationKind::from_u8(bytes[2]).ok_or("unknown operation kind")?;
        let supersedes = read_u64(bytes, 24);
        Ok(Self {
            kind,
            attempts: read_u32(bytes, 4),
            message_offset: read_u64(bytes, 8),
            receipt_id: read_u64(bytes, 16),
            supersedes: (supersedes != NO_RECEIPT).then_some(supersedes),
            timestamp_ms: read_u64(bytes, 32),
            invisible_until_ms: read_u64(bytes, 40),
        })
    }
}

/// An operation together with its position in the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationEntry {
    pub log_offset: u64,
    pub op: Operation,
}

/// Operation log access over the shared stream store.
pub struct OperationLog {
    store: Arc<dyn StreamStore>,
    retry: RetryPolicy,
    fetch_batch: usize,
}

impl OperationLog {
    pub fn new(store: Arc<dyn StreamStore>, retry: RetryPolicy, fetch_batch: usize) -> Self {
        Self {
            store,
            retry,
            fetch_batch: fetch_batch.max(1),
        }
    }

    /// Appends `op` and returns its log offset once it is durable.
    ///
    /// `Unavailable` is retried with backoff. A record whose append reported
    /// failure may still have landed, so replay tolerates duplicates.
    pub fn append(&self, stream: StreamId, op: &Operation) -> Result<u64> {
        let record = op.encode();
        let mut failures = 0u32;
        loop {
            match self.store.append(stream, &record) {
                Ok(offset) => return Ok(offset),
                Err(err) if err.is_retryable() && failures + 1 < self.retry.max_attempts => {
                    failures += 1;
                    let delay = self.retry.backoff(failures);
                    log::warn!(
                        "operation log append to {stream} failed ({err}), retry {failures} in {delay:?}"
                    );
                    thread::sleep(delay);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Lazily reads every entry from `from` up to the current end of the log.
    pub fn replay(&self, stream: StreamId, from: u64) -> Result<OperationReplay> {
        let start = self.store.start_offset(stream)?;
        if from < start {
            return Err(Error::Trimmed {
                stream,
                offset: from,
            });
        }
        let end = self.store.next_offset(stream)?;
        Ok(OperationReplay {
            store: Arc::clone(&self.store),
            stream,
            next: from,
            end,
            batch: self.fetch_batch,
            buffer: VecDeque::new(),
            failed: false,
        })
    }

    pub fn start_offset(&self, stream: StreamId) -> Result<u64> {
        self.store.start_offset(stream)
    }

    pub fn next_offset(&self, stream: StreamId) -> Result<u64> {
        self.store.next_offset(stream)
    }

    pub fn trim(&self, stream: StreamId, offset: u64) -> Result<()> {
        self.store.trim(stream, offset)
    }
}

/// Finite iterator over a snapshot of the log's extent.
///
/// After an error the iterator stops; a new replay from [`position`] resumes
/// where it left off.
///
/// [`position`]: OperationReplay::position
pub struct OperationReplay {
    store: Arc<dyn StreamStore>,
    stream: StreamId,
    next: u64,
    end: u64,
    batch: usize,
    buffer: VecDeque<StreamRecord>,
    failed: bool,
}

impl OperationReplay {
    /// Log offset of the next entry this replay would yield.
    pub fn position(&self) -> u64 {
        self.buffer.front().map_or(self.next, |record| record.offset)
    }

    /// Log offset at which this replay stops.
    pub fn end(&self) -> u64 {
        self.end
    }

    fn refill(&mut self) -> Result<()> {
        let want = self.batch.min((self.end - self.next) as usize);
        let records = self.store.fetch(self.stream, self.next, want)?;
        if records.is_empty() {
            return Err(Error::Corrupt(format!(
                "operation log {} ends at {} before expected end {}",
                self.stream, self.next, self.end
            )));
        }
        self.next += records.len() as u64;
        self.buffer.extend(records);
        Ok(())
    }
}

impl Iterator for OperationReplay {
    type Item = Result<OperationEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.buffer.is_empty() {
            if self.next >= self.end {
                return None;
            }
            if let Err(err) = self.refill() {
                self.failed = true;
                return Some(Err(err));
            }
        }
        let record = self.buffer.pop_front()?;
        match Operation::decode(&record.payload) {
            Ok(op) => Some(Ok(OperationEntry {
                log_offset: record.offset,
                op,
            })),
            Err(reason) => {
                self.failed = true;
                Some(Err(Error::Corrupt(format!(
                    "{} at offset {} of {}",
                    reason, record.offset, self.stream
                ))))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStreamStore;

    const STREAM: StreamId = StreamId(11);

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    #[test]
    fn test_decode_matches_encoded_fields() {
        let op = Operation::timeout(20, 3, 4, 2, 1_000, 31_000);
        let decoded = Operation::decode(&op.encode()).unwrap();
        assert_eq!(decoded, op);
        assert_eq!(decoded.supersedes, Some(3));
        assert_eq!(Operation::decode(&Operation::ack(1, 2, 3).encode()).unwrap().supersedes, None);
    }

    #[test]
    fn test_decode_rejects_damaged_record() {
        let mut record = Operation::ack(10, 1, 5).encode();
        record[9] ^= 0x40;
        assert_eq!(
            Operation::decode(&record),
            Err("operation record checksum mismatch")
        );
        assert!(Operation::decode(&record[..40]).is_err());
    }

    #[test]
    fn test_append_retries_unavailable_store() {
        let store = Arc::new(MemoryStreamStore::new());
        let log = OperationLog::new(store.clone(), fast_retry(4), 16);
        store.fail_next_appends(3);
        let offset = log.append(STREAM, &Operation::ack(1, 1, 1)).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(store.next_offset(STREAM).unwrap(), 1);
    }

    #[test]
    fn test_append_surfaces_persistent_failure() {
        let store = Arc::new(MemoryStreamStore::new());
        let log = OperationLog::new(store.clone(), fast_retry(3), 16);
        store.fail_next_appends(3);
        let err = log.append(STREAM, &Operation::ack(1, 1, 1)).unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
        assert_eq!(store.next_offset(STREAM).unwrap(), 0);
    }

    #[test]
    fn test_replay_is_lazy_and_restartable() {
        let store = Arc::new(MemoryStreamStore::new());
        let log = OperationLog::new(store.clone(), fast_retry(1), 2);
        for receipt in 0..5 {
            log.append(STREAM, &Operation::pop(receipt, receipt, None, 0, 0, 10))
                .unwrap();
        }

        let mut replay = log.replay(STREAM, 1).unwrap();
        assert_eq!(replay.end(), 5);
        let first = replay.next().unwrap().unwrap();
        assert_eq!(first.log_offset, 1);
        assert_eq!(first.op.receipt_id, 1);

        store.fail_next_fetches(1);
        let _ = replay.next().unwrap().unwrap();
        assert!(replay.next().unwrap().is_err());
        assert!(replay.next().is_none());

        let resumed: Vec<_> = log
            .replay(STREAM, replay.position())
            .unwrap()
            .map(|entry| entry.unwrap().log_offset)
            .collect();
        assert_eq!(resumed, vec![3, 4]);
    }

    #[test]
    fn test_replay_below_trim_point_is_rejected() {
        let store = Arc::new(MemoryStreamStore::new());
        let log = OperationLog::new(store.clone(), fast_retry(1), 2);
        for receipt in 0..3 {
            log.append(STREAM, &Operation::ack(receipt, receipt, 0)).unwrap();
        }
        log.trim(STREAM, 2).unwrap();
        assert!(matches!(log.replay(STREAM, 0), Err(Error::Trimmed { .. })));
        assert_eq!(log.replay(STREAM, 2).unwrap().count(), 1);
    }
}
