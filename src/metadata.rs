use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::message::{QueueId, StreamId};
use crate::sync::{read, write};
use crate::{Error, Result};

/// Static facts about a queue, owned by the metadata service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub queue: QueueId,
    /// Stream holding the queue's messages. Several queues may share one.
    pub data_stream: StreamId,
    /// Stream holding the queue's operation log. Never shared.
    pub operation_stream: StreamId,
    /// Expiries tolerated before a message is dead-lettered.
    pub max_retries: u32,
}

/// Read-only view of queue metadata.
pub trait MetadataService: Send + Sync {
    fn queue_config(&self, queue: QueueId) -> Result<QueueConfig>;
    fn queues(&self) -> Vec<QueueId>;
}

/// Metadata held in memory, registered up front by the embedding process.
#[derive(Default)]
pub struct StaticMetadata {
    queues: RwLock<BTreeMap<QueueId, QueueConfig>>,
}

impl StaticMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, config: QueueConfig) -> Result<()> {
        let mut queues = write(&self.queues);
        let clash = queues.values().any(|existing| {
            existing.queue != config.queue
                && (existing.operation_stream == config.operation_stream
                    || existing.operation_stream == config.data_stream
                    || existing.data_stream == config.operation_stream)
        });
        if clash || config.data_stream == config.operation_stream {
            return Err(Error::InvalidArgument(
                "operation streams cannot be shared with any other stream",
            ));
        }
        queues.insert(config.queue, config);
        Ok(())
    }

    /// Registers a queue with dedicated streams derived from its identity.
    ///
    /// The topic id must fit in 31 bits so the derived stream ids stay unique.
    pub fn register_simple(&self, queue: QueueId, max_retries: u32) -> Result<QueueConfig> {
        if queue.topic_id >> 31 != 0 {
            return Err(Error::InvalidArgument(
                "topic id too large to derive stream ids from",
            ));
        }
        let base = (queue.topic_id << 33) | (u64::from(queue.queue_id) << 1);
        let config = QueueConfig {
            queue,
            data_stream: StreamId(base),
            operation_stream: StreamId(base | 1),
            max_retries,
        };
        self.register(config)?;
        Ok(config)
    }
}

impl MetadataService for StaticMetadata {
    fn queue_config(&self, queue: QueueId) -> Result<QueueConfig> {
        read(&self.queues)
            .get(&queue)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("queue {queue}")))
    }

    fn queues(&self) -> Vec<QueueId> {
        read(&self.queues).keys().copied().collect()
    }
}
