use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const MESSAGE_MAGIC: u16 = 0x504D; // 'PM'
pub const MESSAGE_HEADER_SIZE: usize = 32;

const FLAG_DELAYED: u16 = 0x0001;

const MAGIC_OFFSET: usize = 0;
const FLAGS_OFFSET: usize = 2;
const BORN_OFFSET: usize = 4;
const DELAY_OFFSET: usize = 12;
const LEN_OFFSET: usize = 20;
const CRC_OFFSET: usize = 24;

/// Identity of a logic queue: a topic plus a queue index within it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueId {
    pub topic_id: u64,
    pub queue_id: u32,
}

impl QueueId {
    pub const fn new(topic_id: u64, queue_id: u32) -> Self {
        Self { topic_id, queue_id }
    }

    /// Key used to namespace this queue's records in the key-value store.
    pub fn kv_key(&self) -> String {
        format!("{}:{}", self.topic_id, self.queue_id)
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic_id, self.queue_id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// A message read from a queue's data stream.
///
/// The payload is shared with the stream store's record buffer; clones are cheap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub queue: QueueId,
    pub offset: u64,
    /// Number of times this message's visibility window expired before now.
    pub attempts: u32,
    pub born_ms: u64,
    pub delay_until_ms: Option<u64>,
    pub payload: Arc<[u8]>,
}

impl Message {
    pub fn is_delayed_at(&self, now_ms: u64) -> bool {
        matches!(self.delay_until_ms, Some(until) if until > now_ms)
    }

    /// Decodes a data-stream record written by [`encode_message`].
    pub fn decode(queue: QueueId, offset: u64, bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MESSAGE_HEADER_SIZE {
            return Err(Error::Corrupt(format!(
                "message record at offset {offset} of queue {queue} is truncated"
            )));
        }
        let magic = read_u16(bytes, MAGIC_OFFSET);
        if magic != MESSAGE_MAGIC {
            return Err(Error::Corrupt(format!(
                "message record at offset {offset} of queue {queue} has bad magic {magic:#06x}"
            )));
        }
        let flags = read_u16(bytes, FLAGS_OFFSET);
        let born_ms = read_u64(bytes, BORN_OFFSET);
        let delay_until_ms = read_u64(bytes, DELAY_OFFSET);
        let payload_len = read_u32(bytes, LEN_OFFSET) as usize;
        let checksum = read_u32(bytes, CRC_OFFSET);

        let payload = bytes
            .get(MESSAGE_HEADER_SIZE..MESSAGE_HEADER_SIZE + payload_len)
            .ok_or_else(|| {
                Error::Corrupt(format!(
                    "message payload at offset {offset} of queue {queue} is truncated"
                ))
            })?;
        if crc32fast::hash(payload) != checksum {
            return Err(Error::Corrupt(format!(
                "message checksum mismatch at offset {offset} of queue {queue}"
            )));
        }

        Ok(Self {
            queue,
            offset,
            attempts: 0,
            born_ms,
            delay_until_ms: (flags & FLAG_DELAYED != 0).then_some(delay_until_ms),
            payload: Arc::from(payload),
        })
    }
}

/// Encodes a producer message into its data-stream record layout.
pub fn encode_message(born_ms: u64, delay_until_ms: Option<u64>, payload: &[u8]) -> Result<Vec<u8>> {
    let payload_len =
        u32::try_from(payload.len()).map_err(|_| Error::InvalidArgument("payload too large"))?;
    let mut buf = Vec::with_capacity(MESSAGE_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&MESSAGE_MAGIC.to_le_bytes());
    let flags = if delay_until_ms.is_some() { FLAG_DELAYED } else { 0 };
    buf.extend_from_slice(&flags.to_le_bytes());
    buf.extend_from_slice(&born_ms.to_le_bytes());
    buf.extend_from_slice(&delay_until_ms.unwrap_or(0).to_le_bytes());
    buf.extend_from_slice(&payload_len.to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    buf.extend_from_slice(&[0u8; 4]);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Opaque token handed to a consumer for one delivery of one message.
///
/// Each delivery gets a fresh receipt id, so a handle from an expired
/// delivery can never ack a later one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ReceiptHandle {
    pub queue: QueueId,
    pub offset: u64,
    pub receipt_id: u64,
}

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:x}-{:x}-{:x}-{:x}",
            self.queue.topic_id, self.queue.queue_id, self.offset, self.receipt_id
        )
    }
}

impl FromStr for ReceiptHandle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('-');
        let mut next = || -> Result<u64> {
            let part = parts
                .next()
                .ok_or(Error::InvalidArgument("receipt handle has too few fields"))?;
            u64::from_str_radix(part, 16)
                .map_err(|_| Error::InvalidArgument("receipt handle field is not hex"))
        };
        let topic_id = next()?;
        let queue_id = u32::try_from(next()?)
            .map_err(|_| Error::InvalidArgument("receipt handle queue id out of range"))?;
        let offset = next()?;
        let receipt_id = next()?;
        if parts.next().is_some() {
            return Err(Error::InvalidArgument("receipt handle has too many fields"));
        }
        Ok(Self {
            queue: QueueId::new(topic_id, queue_id),
            offset,
            receipt_id,
        })
    }
}

/// A message delivered by `pop`, paired with the handle that acks it.
#[derive(Clone, Debug)]
pub struct Receipt {
    pub handle: ReceiptHandle,
    pub message: Message,
    pub invisible_until_ms: u64,
}

pub(crate) fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes(buf[at..at + 2].try_into().expect("slice length"))
}

pub(crate) fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().expect("slice length"))
}

pub(crate) fn read_u64(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(buf[at..at + 8].try_into().expect("slice length"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUEUE: QueueId = QueueId::new(7, 2);

    #[test]
    fn test_message_decode_keeps_delay() {
        let record = encode_message(1_000, Some(5_000), b"hello").unwrap();
        let message = Message::decode(QUEUE, 42, &record).unwrap();
        assert_eq!(message.offset, 42);
        assert_eq!(message.born_ms, 1_000);
        assert_eq!(message.delay_until_ms, Some(5_000));
        assert_eq!(&*message.payload, b"hello");
        assert!(message.is_delayed_at(4_999));
        assert!(!message.is_delayed_at(5_000));
    }

    #[test]
    fn test_message_decode_rejects_flipped_payload() {
        let mut record = encode_message(1_000, None, b"hello").unwrap();
        let last = record.len() - 1;
        record[last] ^= 0xFF;
        let err = Message::decode(QUEUE, 0, &record).unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }

    #[test]
    fn test_message_decode_rejects_truncated_record() {
        let record = encode_message(1_000, None, b"hello").unwrap();
        let err = Message::decode(QUEUE, 0, &record[..MESSAGE_HEADER_SIZE + 2]).unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }

    #[test]
    fn test_receipt_handle_parses_its_display_form() {
        let handle = ReceiptHandle {
            queue: QUEUE,
            offset: 10,
            receipt_id: 99,
        };
        let text = handle.to_string();
        assert_eq!(text.parse::<ReceiptHandle>().unwrap(), handle);
        assert!("7-2-a".parse::<ReceiptHandle>().is_err());
        assert!("zz-2-a-1".parse::<ReceiptHandle>().is_err());
    }
}
