use std::time::Duration;

use crate::message::{QueueId, StreamId};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unknown queue, stream or receipt handle.
    #[error("not found: {0}")]
    NotFound(String),
    /// Pop waited for its whole budget without any message becoming available.
    #[error("no message available within {0:?}")]
    Timeout(Duration),
    /// Stream store or key-value store is transiently unreachable.
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// Persisted state references data that was never written.
    #[error("corrupt data: {0}")]
    Corrupt(String),
    #[error("queue {0} is offline")]
    QueueOffline(QueueId),
    #[error("offset {offset} of stream {stream} has been trimmed")]
    Trimmed { stream: StreamId, offset: u64 },
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("store is shut down")]
    Shutdown,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl Error {
    /// Transient failures that are worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Unavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
