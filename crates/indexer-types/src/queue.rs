//! Durable queue entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::MutationEvent;

/// An event persisted in a durable queue.
///
/// `sequence` is the entry's position in its queue and changes when the
/// entry is requeued. `retry_count` only grows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    #[serde(skip)]
    pub sequence: u64,
    pub event: MutationEvent,
    #[serde(default)]
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(event: MutationEvent) -> Self {
        Self {
            sequence: 0,
            event,
            retry_count: 0,
            enqueued_at: Utc::now(),
        }
    }

    /// Copy of this entry for a retry attempt.
    pub fn next_attempt(&self) -> Self {
        Self {
            sequence: self.sequence,
            event: self.event.clone(),
            retry_count: self.retry_count.saturating_add(1),
            enqueued_at: self.enqueued_at,
        }
    }

    /// Serialize to JSON bytes. The sequence lives in the storage key.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from JSON bytes, attaching the sequence from the key.
    pub fn from_bytes(sequence: u64, bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let mut entry: QueueEntry = serde_json::from_slice(bytes)?;
        entry.sequence = sequence;
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_attempt_increments_retry() {
        let entry = QueueEntry::new(MutationEvent::for_path("content/ADDED", "/a"));
        let retry = entry.next_attempt().next_attempt();
        assert_eq!(retry.retry_count, 2);
        assert_eq!(retry.event, entry.event);
    }

    #[test]
    fn test_sequence_comes_from_key() {
        let mut entry = QueueEntry::new(MutationEvent::for_path("content/ADDED", "/a"));
        entry.sequence = 7;
        let bytes = entry.to_bytes().unwrap();
        let decoded = QueueEntry::from_bytes(42, &bytes).unwrap();
        assert_eq!(decoded.sequence, 42);
        assert_eq!(decoded.event.path(), "/a");
    }
}
