//! RocksDB-backed durable FIFO queue.
//!
//! Provides:
//! - Append at the tail, requeue at the front
//! - In-memory leases so delivered entries are not handed out twice
//! - Async batch dequeue with a bounded wait
//! - Dead-lettering of entries that exhausted their retries

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rocksdb::{IteratorMode, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::column_families::{build_cf_descriptors, ALL_CF_NAMES, CF_DEAD_LETTER, CF_PENDING};
use crate::error::StorageError;
use crate::keys::{dead_letter_key, QueueKey, TAIL_START};
use indexer_types::{MutationEvent, QueueEntry};

/// An entry removed from the queue without being indexed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// `None` when the stored bytes could not be decoded.
    pub entry: Option<QueueEntry>,
    /// Raw stored value for undecodable entries.
    #[serde(default)]
    pub raw: Option<String>,
    pub reason: String,
    pub dropped_at: DateTime<Utc>,
}

/// Point-in-time queue metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub name: String,
    /// Entries not yet acknowledged, including in-flight ones
    pub depth: u64,
    /// Entries delivered and awaiting ack or requeue
    pub in_flight: u64,
    pub dead_letters: u64,
}

/// A named durable queue stored in its own RocksDB database.
pub struct DurableQueue {
    name: String,
    db: DB,
    /// Next position handed out at the tail
    tail: AtomicU64,
    /// Next position handed out at the front (grows downward)
    head: Mutex<u64>,
    leased: Mutex<BTreeSet<u64>>,
    depth: AtomicU64,
    dead_letters: AtomicU64,
    notify: Notify,
}

impl DurableQueue {
    /// Open the queue at `path`, creating it if necessary.
    ///
    /// Any entries already on disk were never acknowledged and are delivered
    /// before anything enqueued from now on.
    pub fn open(path: &Path, name: &str) -> Result<Self, StorageError> {
        info!(queue = name, "Opening durable queue at {:?}", path);

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_background_jobs(2);

        let db = DB::open_cf_descriptors(&db_opts, path, build_cf_descriptors())?;

        let (head, tail, depth) = Self::load_positions(&db)?;
        let dead_letters = Self::count_cf(&db, CF_DEAD_LETTER)?;

        if depth > 0 {
            info!(queue = name, depth, "Recovered pending entries");
        }

        Ok(Self {
            name: name.to_string(),
            db,
            tail: AtomicU64::new(tail),
            head: Mutex::new(head),
            leased: Mutex::new(BTreeSet::new()),
            depth: AtomicU64::new(depth),
            dead_letters: AtomicU64::new(dead_letters),
            notify: Notify::new(),
        })
    }

    /// Restore (next front position, next tail position, pending count).
    fn load_positions(db: &DB) -> Result<(u64, u64, u64), StorageError> {
        let cf = db
            .cf_handle(CF_PENDING)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(CF_PENDING.to_string()))?;

        let mut head = TAIL_START - 1;
        if let Some(item) = db.iterator_cf(&cf, IteratorMode::Start).next() {
            let (key, _) = item?;
            let first = QueueKey::from_bytes(&key)?.position;
            if first < TAIL_START {
                head = first.saturating_sub(1);
            }
        }

        let mut tail = TAIL_START;
        if let Some(item) = db.iterator_cf(&cf, IteratorMode::End).next() {
            let (key, _) = item?;
            let last = QueueKey::from_bytes(&key)?.position;
            if last >= TAIL_START {
                tail = last + 1;
            }
        }

        let depth = Self::count_cf(db, CF_PENDING)?;
        Ok((head, tail, depth))
    }

    fn count_cf(db: &DB, cf_name: &str) -> Result<u64, StorageError> {
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(cf_name.to_string()))?;
        let mut count = 0;
        for item in db.iterator_cf(&cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append an event at the tail.
    pub fn enqueue(&self, event: MutationEvent) -> Result<QueueEntry, StorageError> {
        let cf = self.cf(CF_PENDING)?;

        let mut entry = QueueEntry::new(event);
        entry.sequence = self.tail.fetch_add(1, Ordering::SeqCst);
        let bytes = entry.to_bytes()?;

        self.db
            .put_cf(&cf, QueueKey::new(entry.sequence).to_bytes(), bytes)?;
        self.depth.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_one();

        debug!(
            queue = %self.name,
            sequence = entry.sequence,
            event_id = %entry.event.event_id,
            topic = %entry.event.topic,
            "Enqueued event"
        );
        Ok(entry)
    }

    /// Wait up to `max_wait` for at least one entry, then return up to
    /// `max_size` entries in delivery order.
    ///
    /// Returns an empty batch on timeout. Cancel-safe: entries are leased
    /// only in the synchronous step right before returning.
    pub async fn dequeue_batch(
        &self,
        max_size: usize,
        max_wait: Duration,
    ) -> Result<Vec<QueueEntry>, StorageError> {
        if max_size == 0 {
            return Ok(Vec::new());
        }
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let batch = self.try_dequeue(max_size)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(Vec::new());
            }
        }
    }

    /// Lease up to `max_size` available entries without waiting.
    pub fn try_dequeue(&self, max_size: usize) -> Result<Vec<QueueEntry>, StorageError> {
        let cf = self.cf(CF_PENDING)?;
        let mut leased = self.leased.lock().expect("lease lock poisoned");

        let mut batch = Vec::new();
        let mut corrupt = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            if batch.len() >= max_size {
                break;
            }
            let (key, value) = item?;
            let position = QueueKey::from_bytes(&key)?.position;
            if leased.contains(&position) {
                continue;
            }
            match QueueEntry::from_bytes(position, &value) {
                Ok(entry) => batch.push(entry),
                Err(e) => corrupt.push((position, value.to_vec(), e.to_string())),
            }
        }

        for entry in &batch {
            leased.insert(entry.sequence);
        }
        drop(leased);

        if !corrupt.is_empty() {
            self.discard_corrupt(corrupt)?;
        }
        Ok(batch)
    }

    /// Move undecodable entries out of the way so they cannot block the head.
    fn discard_corrupt(&self, corrupt: Vec<(u64, Vec<u8>, String)>) -> Result<(), StorageError> {
        let pending = self.cf(CF_PENDING)?;
        let dead = self.cf(CF_DEAD_LETTER)?;
        let now = Utc::now();

        let mut batch = WriteBatch::default();
        for (position, raw, reason) in &corrupt {
            error!(
                queue = %self.name,
                sequence = position,
                data_loss = true,
                "Undecodable queue entry moved to dead letters: {}",
                reason
            );
            let record = DeadLetter {
                entry: None,
                raw: Some(String::from_utf8_lossy(raw).into_owned()),
                reason: format!("undecodable entry: {}", reason),
                dropped_at: now,
            };
            batch.delete_cf(&pending, QueueKey::new(*position).to_bytes());
            batch.put_cf(
                &dead,
                dead_letter_key(now.timestamp_millis(), *position),
                serde_json::to_vec(&record)?,
            );
        }
        self.db.write(batch)?;

        let n = corrupt.len() as u64;
        self.decrement_depth(n);
        self.dead_letters.fetch_add(n, Ordering::SeqCst);
        Ok(())
    }

    /// Remove delivered entries for good.
    pub fn ack(&self, entries: &[QueueEntry]) -> Result<usize, StorageError> {
        if entries.is_empty() {
            return Ok(0);
        }
        let cf = self.cf(CF_PENDING)?;

        let mut batch = WriteBatch::default();
        for entry in entries {
            batch.delete_cf(&cf, QueueKey::new(entry.sequence).to_bytes());
        }
        self.db.write(batch)?;

        self.release(entries);
        self.decrement_depth(entries.len() as u64);
        debug!(queue = %self.name, count = entries.len(), "Acknowledged entries");
        Ok(entries.len())
    }

    /// Put delivered entries back at the front with their retry count bumped.
    ///
    /// The entries keep their relative order and are delivered before
    /// anything else. Returns the rewritten entries.
    pub fn requeue(&self, entries: &[QueueEntry]) -> Result<Vec<QueueEntry>, StorageError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let cf = self.cf(CF_PENDING)?;

        let mut ordered: Vec<&QueueEntry> = entries.iter().collect();
        ordered.sort_by_key(|e| e.sequence);

        let first = self.reserve_front(ordered.len() as u64)?;

        let mut batch = WriteBatch::default();
        let mut rewritten = Vec::with_capacity(ordered.len());
        for (offset, entry) in ordered.into_iter().enumerate() {
            let mut next = entry.next_attempt();
            next.sequence = first + offset as u64;
            batch.delete_cf(&cf, QueueKey::new(entry.sequence).to_bytes());
            batch.put_cf(&cf, QueueKey::new(next.sequence).to_bytes(), next.to_bytes()?);
            rewritten.push(next);
        }
        self.db.write(batch)?;

        self.release(entries);
        self.notify.notify_one();
        debug!(queue = %self.name, count = rewritten.len(), "Requeued entries at front");
        Ok(rewritten)
    }

    /// Reserve `count` consecutive front positions, returning the lowest.
    fn reserve_front(&self, count: u64) -> Result<u64, StorageError> {
        let mut head = self.head.lock().expect("head lock poisoned");
        let first = (*head + 1)
            .checked_sub(count)
            .filter(|first| *first > 0)
            .ok_or_else(|| StorageError::Exhausted(self.name.clone()))?;
        *head = first - 1;
        Ok(first)
    }

    /// Move entries from the queue to the dead-letter column family.
    pub fn dead_letter(&self, entries: &[QueueEntry], reason: &str) -> Result<usize, StorageError> {
        if entries.is_empty() {
            return Ok(0);
        }
        let pending = self.cf(CF_PENDING)?;
        let dead = self.cf(CF_DEAD_LETTER)?;
        let now = Utc::now();

        let mut batch = WriteBatch::default();
        for entry in entries {
            let record = DeadLetter {
                entry: Some(entry.clone()),
                raw: None,
                reason: reason.to_string(),
                dropped_at: now,
            };
            batch.delete_cf(&pending, QueueKey::new(entry.sequence).to_bytes());
            batch.put_cf(
                &dead,
                dead_letter_key(now.timestamp_millis(), entry.sequence),
                serde_json::to_vec(&record)?,
            );
        }
        self.db.write(batch)?;

        self.release(entries);
        self.decrement_depth(entries.len() as u64);
        self.dead_letters
            .fetch_add(entries.len() as u64, Ordering::SeqCst);
        Ok(entries.len())
    }

    /// Forget all leases so every pending entry is deliverable again.
    pub fn release_leases(&self) -> usize {
        let mut leased = self.leased.lock().expect("lease lock poisoned");
        let count = leased.len();
        leased.clear();
        drop(leased);
        if count > 0 {
            self.notify.notify_one();
        }
        count
    }

    fn release(&self, entries: &[QueueEntry]) {
        let mut leased = self.leased.lock().expect("lease lock poisoned");
        for entry in entries {
            leased.remove(&entry.sequence);
        }
    }

    fn decrement_depth(&self, n: u64) {
        let _ = self
            .depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| {
                Some(d.saturating_sub(n))
            });
    }

    /// Entries not yet acknowledged, including in-flight ones.
    pub fn depth(&self) -> u64 {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> u64 {
        self.leased.lock().expect("lease lock poisoned").len() as u64
    }

    pub fn dead_letter_count(&self) -> u64 {
        self.dead_letters.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            name: self.name.clone(),
            depth: self.depth(),
            in_flight: self.in_flight(),
            dead_letters: self.dead_letter_count(),
        }
    }

    /// Oldest dead letters first.
    pub fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, StorageError> {
        let cf = self.cf(CF_DEAD_LETTER)?;
        let mut results = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start).take(limit) {
            let (_, value) = item?;
            results.push(serde_json::from_slice(&value)?);
        }
        Ok(results)
    }

    /// Flush all column families to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        for cf_name in ALL_CF_NAMES {
            if let Some(cf) = self.db.cf_handle(cf_name) {
                self.db.flush_cf(&cf)?;
            }
        }
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_queue() -> (DurableQueue, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let queue = DurableQueue::open(temp_dir.path(), "test").unwrap();
        (queue, temp_dir)
    }

    fn event(path: &str) -> MutationEvent {
        MutationEvent::for_path("content/ADDED", path)
    }

    fn paths(entries: &[QueueEntry]) -> Vec<String> {
        entries.iter().map(|e| e.event.path().to_string()).collect()
    }

    #[test]
    fn test_open_creates_column_families() {
        let (queue, _temp) = create_test_queue();
        for cf_name in ALL_CF_NAMES {
            assert!(queue.db.cf_handle(cf_name).is_some(), "CF {} should exist", cf_name);
        }
    }

    #[test]
    fn test_fifo_order() {
        let (queue, _temp) = create_test_queue();
        for p in ["/a", "/b", "/c"] {
            queue.enqueue(event(p)).unwrap();
        }
        assert_eq!(queue.depth(), 3);

        let batch = queue.try_dequeue(2).unwrap();
        assert_eq!(paths(&batch), vec!["/a", "/b"]);
        let rest = queue.try_dequeue(10).unwrap();
        assert_eq!(paths(&rest), vec!["/c"]);
        assert_eq!(queue.in_flight(), 3);
    }

    #[test]
    fn test_leased_entries_not_redelivered() {
        let (queue, _temp) = create_test_queue();
        queue.enqueue(event("/a")).unwrap();

        assert_eq!(queue.try_dequeue(10).unwrap().len(), 1);
        assert!(queue.try_dequeue(10).unwrap().is_empty());

        assert_eq!(queue.release_leases(), 1);
        assert_eq!(queue.try_dequeue(10).unwrap().len(), 1);
    }

    #[test]
    fn test_ack_removes_entries() {
        let (queue, _temp) = create_test_queue();
        queue.enqueue(event("/a")).unwrap();
        queue.enqueue(event("/b")).unwrap();

        let batch = queue.try_dequeue(10).unwrap();
        assert_eq!(queue.ack(&batch).unwrap(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.in_flight(), 0);

        queue.release_leases();
        assert!(queue.try_dequeue(10).unwrap().is_empty());
    }

    #[test]
    fn test_requeue_goes_to_front_in_order() {
        let (queue, _temp) = create_test_queue();
        for p in ["/a", "/b", "/c", "/d"] {
            queue.enqueue(event(p)).unwrap();
        }

        let batch = queue.try_dequeue(2).unwrap();
        let requeued = queue.requeue(&batch).unwrap();
        assert!(requeued.iter().all(|e| e.retry_count == 1));
        assert_eq!(queue.depth(), 4);

        let next = queue.try_dequeue(10).unwrap();
        assert_eq!(paths(&next), vec!["/a", "/b", "/c", "/d"]);
        assert_eq!(next[0].retry_count, 1);
        assert_eq!(next[2].retry_count, 0);
    }

    #[test]
    fn test_repeated_requeue_increments_retry_count() {
        let (queue, _temp) = create_test_queue();
        queue.enqueue(event("/a")).unwrap();

        for expected in 1..=3 {
            let batch = queue.try_dequeue(1).unwrap();
            let requeued = queue.requeue(&batch).unwrap();
            assert_eq!(requeued[0].retry_count, expected);
        }
    }

    #[test]
    fn test_dead_letter_moves_entries() {
        let (queue, _temp) = create_test_queue();
        queue.enqueue(event("/a")).unwrap();
        queue.enqueue(event("/b")).unwrap();

        let batch = queue.try_dequeue(1).unwrap();
        queue.dead_letter(&batch, "retries exhausted").unwrap();

        assert_eq!(queue.depth(), 1);
        assert_eq!(queue.dead_letter_count(), 1);
        let letters = queue.dead_letters(10).unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, "retries exhausted");
        assert_eq!(letters[0].entry.as_ref().unwrap().event.path(), "/a");

        let next = queue.try_dequeue(10).unwrap();
        assert_eq!(paths(&next), vec!["/b"]);
    }

    #[test]
    fn test_reopen_replays_unacked_entries() {
        let temp_dir = TempDir::new().unwrap();
        {
            let queue = DurableQueue::open(temp_dir.path(), "test").unwrap();
            queue.enqueue(event("/a")).unwrap();
            queue.enqueue(event("/b")).unwrap();
            queue.enqueue(event("/c")).unwrap();
            let batch = queue.try_dequeue(1).unwrap();
            queue.ack(&batch).unwrap();
            let batch = queue.try_dequeue(1).unwrap();
            queue.requeue(&batch).unwrap();
            // leases do not survive the process
            queue.try_dequeue(10).unwrap();
        }

        let queue = DurableQueue::open(temp_dir.path(), "test").unwrap();
        assert_eq!(queue.depth(), 2);
        queue.enqueue(event("/d")).unwrap();

        let batch = queue.try_dequeue(10).unwrap();
        assert_eq!(paths(&batch), vec!["/b", "/c", "/d"]);
        assert_eq!(batch[0].retry_count, 1);
    }

    #[test]
    fn test_reopen_keeps_front_below_recovered_head() {
        let temp_dir = TempDir::new().unwrap();
        {
            let queue = DurableQueue::open(temp_dir.path(), "test").unwrap();
            queue.enqueue(event("/a")).unwrap();
            queue.enqueue(event("/b")).unwrap();
            let batch = queue.try_dequeue(1).unwrap();
            queue.requeue(&batch).unwrap();
        }

        let queue = DurableQueue::open(temp_dir.path(), "test").unwrap();
        let batch = queue.try_dequeue(2).unwrap();
        assert_eq!(paths(&batch), vec!["/a", "/b"]);
        let requeued = queue.requeue(&batch[1..]).unwrap();
        assert!(requeued[0].sequence < batch[0].sequence);

        let all = {
            queue.release_leases();
            queue.try_dequeue(10).unwrap()
        };
        assert_eq!(paths(&all), vec!["/b", "/a"]);
    }

    #[tokio::test]
    async fn test_dequeue_batch_times_out_when_empty() {
        let (queue, _temp) = create_test_queue();
        let start = std::time::Instant::now();
        let batch = queue
            .dequeue_batch(10, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(batch.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dequeue_batch_wakes_on_enqueue() {
        let (queue, _temp) = create_test_queue();
        let queue = std::sync::Arc::new(queue);

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                queue.enqueue(event("/late")).unwrap();
            })
        };

        let batch = queue
            .dequeue_batch(10, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(paths(&batch), vec!["/late"]);
        producer.await.unwrap();
    }

    #[test]
    fn test_stats() {
        let (queue, _temp) = create_test_queue();
        queue.enqueue(event("/a")).unwrap();
        queue.enqueue(event("/b")).unwrap();
        queue.try_dequeue(1).unwrap();

        let stats = queue.stats();
        assert_eq!(stats.name, "test");
        assert_eq!(stats.depth, 2);
        assert_eq!(stats.in_flight, 1);
        assert_eq!(stats.dead_letters, 0);
    }
}
