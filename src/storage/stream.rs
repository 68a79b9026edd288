use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::message::StreamId;
use crate::sync::lock;
use crate::{Error, Result};

/// One record of a stream, addressed by its offset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamRecord {
    pub offset: u64,
    pub payload: Arc<[u8]>,
}

/// Ordered, gapless, append-only log per stream.
///
/// Offsets start at zero and grow by one per record. `append` returns only
/// once the record is durable. Records below the start offset have been
/// trimmed and can no longer be fetched.
pub trait StreamStore: Send + Sync {
    fn append(&self, stream: StreamId, payload: &[u8]) -> Result<u64>;

    /// Returns up to `limit` records starting at `offset`. An offset at the
    /// end of the stream yields an empty batch.
    fn fetch(&self, stream: StreamId, offset: u64, limit: usize) -> Result<Vec<StreamRecord>>;

    /// Drops every record below `offset`. Trimming backwards is a no-op.
    fn trim(&self, stream: StreamId, offset: u64) -> Result<()>;

    fn start_offset(&self, stream: StreamId) -> Result<u64>;

    /// Offset the next appended record will receive.
    fn next_offset(&self, stream: StreamId) -> Result<u64>;
}

#[derive(Default)]
struct MemoryStream {
    start: u64,
    records: VecDeque<Arc<[u8]>>,
}

impl MemoryStream {
    fn next_offset(&self) -> u64 {
        self.start + self.records.len() as u64
    }
}

/// In-process stream store. Every stream exists implicitly and starts empty.
///
/// Fault injection makes the next N appends or fetches fail with
/// `Error::Unavailable`, the way a remote store does during a blip.
#[derive(Default)]
pub struct MemoryStreamStore {
    streams: Mutex<HashMap<StreamId, MemoryStream>>,
    failing_appends: AtomicU32,
    failing_fetches: AtomicU32,
}

impl MemoryStreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_appends(&self, count: u32) {
        self.failing_appends.store(count, Ordering::Release);
    }

    pub fn fail_next_fetches(&self, count: u32) {
        self.failing_fetches.store(count, Ordering::Release);
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1))
            .is_ok()
    }
}

impl StreamStore for MemoryStreamStore {
    fn append(&self, stream: StreamId, payload: &[u8]) -> Result<u64> {
        if Self::take_failure(&self.failing_appends) {
            return Err(Error::Unavailable(format!("append to {stream} rejected")));
        }
        let mut streams = lock(&self.streams);
        let entry = streams.entry(stream).or_default();
        let offset = entry.next_offset();
        entry.records.push_back(Arc::from(payload));
        Ok(offset)
    }

    fn fetch(&self, stream: StreamId, offset: u64, limit: usize) -> Result<Vec<StreamRecord>> {
        if Self::take_failure(&self.failing_fetches) {
            return Err(Error::Unavailable(format!("fetch from {stream} rejected")));
        }
        let streams = lock(&self.streams);
        let Some(entry) = streams.get(&stream) else {
            return Ok(Vec::new());
        };
        if offset < entry.start {
            return Err(Error::Trimmed { stream, offset });
        }
        let skip = (offset - entry.start) as usize;
        Ok(entry
            .records
            .iter()
            .skip(skip)
            .take(limit)
            .enumerate()
            .map(|(idx, payload)| StreamRecord {
                offset: offset + idx as u64,
                payload: Arc::clone(payload),
            })
            .collect())
    }

    fn trim(&self, stream: StreamId, offset: u64) -> Result<()> {
        let mut streams = lock(&self.streams);
        let entry = streams.entry(stream).or_default();
        let target = offset.min(entry.next_offset());
        while entry.start < target {
            entry.records.pop_front();
            entry.start += 1;
        }
        Ok(())
    }

    fn start_offset(&self, stream: StreamId) -> Result<u64> {
        Ok(lock(&self.streams).get(&stream).map_or(0, |entry| entry.start))
    }

    fn next_offset(&self, stream: StreamId) -> Result<u64> {
        Ok(lock(&self.streams)
            .get(&stream)
            .map_or(0, MemoryStream::next_offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: StreamId = StreamId(3);

    #[test]
    fn test_append_assigns_gapless_offsets() {
        let store = MemoryStreamStore::new();
        assert_eq!(store.append(STREAM, b"a").unwrap(), 0);
        assert_eq!(store.append(STREAM, b"b").unwrap(), 1);
        assert_eq!(store.append(StreamId(4), b"c").unwrap(), 0);
        assert_eq!(store.next_offset(STREAM).unwrap(), 2);

        let records = store.fetch(STREAM, 1, 10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].offset, 1);
        assert_eq!(&*records[0].payload, b"b");
        assert!(store.fetch(STREAM, 2, 10).unwrap().is_empty());
    }

    #[test]
    fn test_trim_hides_old_records() {
        let store = MemoryStreamStore::new();
        for payload in [b"a", b"b", b"c"] {
            store.append(STREAM, payload).unwrap();
        }
        store.trim(STREAM, 2).unwrap();
        store.trim(STREAM, 1).unwrap();
        assert_eq!(store.start_offset(STREAM).unwrap(), 2);
        assert!(matches!(
            store.fetch(STREAM, 1, 1),
            Err(Error::Trimmed { offset: 1, .. })
        ));
        assert_eq!(store.fetch(STREAM, 2, 5).unwrap()[0].offset, 2);

        store.trim(STREAM, 100).unwrap();
        assert_eq!(store.start_offset(STREAM).unwrap(), 3);
        assert_eq!(store.append(STREAM, b"d").unwrap(), 3);
    }

    #[test]
    fn test_injected_failures_are_consumed() {
        let store = MemoryStreamStore::new();
        store.fail_next_appends(2);
        assert!(matches!(store.append(STREAM, b"a"), Err(Error::Unavailable(_))));
        assert!(matches!(store.append(STREAM, b"a"), Err(Error::Unavailable(_))));
        assert_eq!(store.append(STREAM, b"a").unwrap(), 0);

        store.fail_next_fetches(1);
        assert!(store.fetch(STREAM, 0, 1).is_err());
        assert_eq!(store.fetch(STREAM, 0, 1).unwrap().len(), 1);
    }
}
