//! Dispatcher counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct DispatcherStats {
    pub batches: AtomicU64,
    pub entries_committed: AtomicU64,
    pub documents_added: AtomicU64,
    pub delete_queries: AtomicU64,
    pub rejected_documents: AtomicU64,
    pub rejected_queries: AtomicU64,
    pub requeued: AtomicU64,
    /// Entries dead-lettered after the retry ceiling
    pub dropped: AtomicU64,
    pub transient_failures: AtomicU64,
    pub queue_errors: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherStatsSnapshot {
    pub batches: u64,
    pub entries_committed: u64,
    pub documents_added: u64,
    pub delete_queries: u64,
    pub rejected_documents: u64,
    pub rejected_queries: u64,
    pub requeued: u64,
    pub dropped: u64,
    pub transient_failures: u64,
    pub queue_errors: u64,
}

impl DispatcherStats {
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            entries_committed: self.entries_committed.load(Ordering::Relaxed),
            documents_added: self.documents_added.load(Ordering::Relaxed),
            delete_queries: self.delete_queries.load(Ordering::Relaxed),
            rejected_documents: self.rejected_documents.load(Ordering::Relaxed),
            rejected_queries: self.rejected_queries.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            transient_failures: self.transient_failures.load(Ordering::Relaxed),
            queue_errors: self.queue_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = DispatcherStats::default();
        DispatcherStats::add(&stats.batches, 2);
        DispatcherStats::add(&stats.dropped, 1);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.batches, 2);
        assert_eq!(snapshot.dropped, 1);
        assert_eq!(snapshot.requeued, 0);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["batches"], 2);
    }
}
