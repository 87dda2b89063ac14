//! Durable event queue for the content indexer.
//!
//! Provides a RocksDB-backed FIFO queue with:
//! - Column family isolation for pending and dead-lettered entries
//! - Zero-padded position keys so key order equals delivery order
//! - Atomic ack, requeue and dead-letter via WriteBatch
//! - Replay of every unacknowledged entry after a restart

pub mod column_families;
pub mod error;
pub mod keys;
pub mod queue;

pub use error::StorageError;
pub use keys::QueueKey;
pub use queue::{DeadLetter, DurableQueue, QueueStats};
