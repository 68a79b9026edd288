//! Durable pop/ack queues over an append-only stream store.
//!
//! Producers append messages to a data stream. Consumers `pop` them with a
//! visibility timeout and `ack` them when done; a message that is not acked in
//! time comes back with a new receipt handle, and one that keeps failing is
//! dead-lettered. Every state transition is written to a per-queue operation
//! log before it takes effect, and periodic snapshots bound how much of that
//! log recovery has to replay.

pub mod clock;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod inflight;
pub mod message;
pub mod metadata;
pub mod notifier;
pub mod oplog;
pub mod queue;
pub mod reclaim;
pub mod revive;
pub mod snapshot;
pub mod storage;
pub mod store;
mod sync;
pub mod timer;

pub use clock::{Clock, ManualClock, QuantaClock, SystemClock};
pub use config::StoreConfig;
pub use dead_letter::{DeadLetterSender, MemoryDeadLetterSender};
pub use error::{Error, Result};
pub use message::{Message, QueueId, Receipt, ReceiptHandle, StreamId};
pub use metadata::{MetadataService, QueueConfig, StaticMetadata};
pub use queue::{AckStatus, ChangeInvisibleStatus, LogicQueueManager, QueueStats};
pub use store::{MessageStore, MessageStoreBuilder};
