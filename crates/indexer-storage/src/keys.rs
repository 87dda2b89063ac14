//! Key encoding for queue positions.
//!
//! Key format: `q:{position:020}`. Positions appended at the tail start at
//! [`TAIL_START`] and grow; requeued entries take positions below the head
//! and grow downward. Lexicographic key order is delivery order.

use crate::error::StorageError;

/// First position handed out at the tail.
pub const TAIL_START: u64 = 1 << 63;

/// Key for a queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct QueueKey {
    pub position: u64,
}

impl QueueKey {
    pub fn new(position: u64) -> Self {
        Self { position }
    }

    /// Encode key to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        format!("q:{:020}", self.position).into_bytes()
    }

    /// Decode key from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        let s = std::str::from_utf8(bytes)
            .map_err(|e| StorageError::Key(format!("Invalid UTF-8: {}", e)))?;
        let position = s
            .strip_prefix("q:")
            .ok_or_else(|| StorageError::Key(format!("Invalid queue key format: {}", s)))?
            .parse::<u64>()
            .map_err(|e| StorageError::Key(format!("Invalid position: {}", e)))?;
        Ok(Self { position })
    }
}

/// Key for a dead-lettered entry.
/// Format: `dl:{dropped_at_ms:013}:{position:020}`
///
/// Positions restart after the pending column family drains, so the drop
/// time keeps dead-letter keys unique.
pub fn dead_letter_key(dropped_at_ms: i64, position: u64) -> Vec<u8> {
    format!("dl:{:013}:{:020}", dropped_at_ms, position).into_bytes()
}
