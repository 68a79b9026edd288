use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::message::Message;
use crate::sync::lock;
use crate::{Error, Result};

/// Transport for messages that exhausted their retry budget.
///
/// A failed send is retried by the revive path; the message stays inflight
/// until a send succeeds, so implementations may see duplicates.
pub trait DeadLetterSender: Send + Sync {
    fn send(&self, message: &Message) -> Result<()>;
}

/// Collects dead-lettered messages in memory.
#[derive(Default)]
pub struct MemoryDeadLetterSender {
    sent: Mutex<Vec<Message>>,
    failing_sends: AtomicU32,
}

impl MemoryDeadLetterSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_sends(&self, count: u32) {
        self.failing_sends.store(count, Ordering::Release);
    }

    pub fn sent(&self) -> Vec<Message> {
        lock(&self.sent).clone()
    }
}

impl DeadLetterSender for MemoryDeadLetterSender {
    fn send(&self, message: &Message) -> Result<()> {
        let failing = self
            .failing_sends
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Unavailable(format!(
                "dead-letter send of offset {} rejected",
                message.offset
            )));
        }
        lock(&self.sent).push(message.clone());
        Ok(())
    }
}

/// Drops dead-lettered messages after logging them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingDeadLetterSender;

impl DeadLetterSender for LoggingDeadLetterSender {
    fn send(&self, message: &Message) -> Result<()> {
        log::warn!(
            "dead-lettered message queue={} offset={} attempts={} bytes={}",
            message.queue,
            message.offset,
            message.attempts,
            message.payload.len()
        );
        Ok(())
    }
}
