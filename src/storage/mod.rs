//! Boundaries to the external storage collaborators.
//!
//! The queue layer consumes two primitives: an ordered, gapless, durable
//! append-only log per stream, and a small sorted key-value map. Both are
//! traits so tests can swap in in-memory doubles with fault injection.

pub mod kv;
pub mod segment;
pub mod stream;

pub use kv::{FileKvStore, KvStore, MemoryKvStore};
pub use segment::FileStreamStore;
pub use stream::{MemoryStreamStore, StreamRecord, StreamStore};
