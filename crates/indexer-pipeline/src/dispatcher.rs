//! Queue dispatcher.
//!
//! One dispatcher drains one durable queue into one document store client.
//! The client is owned by the dispatcher task while it runs and handed back
//! on `stop`, so no store write can happen after `stop` returns.
//!
//! Per batch: build documents and delete queries in queue order, apply them
//! in that order, commit, then acknowledge. Building and writing run on the
//! blocking pool since handlers and stores may block. A batch that cannot be
//! committed is rolled back and requeued at the front with its retry counts
//! bumped; entries past the retry ceiling are dead-lettered instead.

use std::slice;
use std::sync::{Arc, RwLock};

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use indexer_handlers::IndexingCoordinator;
use indexer_search::{DocumentStore, StoreError};
use indexer_storage::DurableQueue;
use indexer_types::{IndexDocument, QueueEntry};

use crate::config::{DispatcherConfig, QueueConfig};
use crate::error::PipelineError;
use crate::stats::{DispatcherStats, DispatcherStatsSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatcherState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Store operations of a batch, adjacent operations of one kind merged.
#[derive(Debug)]
enum StoreOp {
    Add(Vec<IndexDocument>),
    Delete(Vec<String>),
}

fn push_op(ops: &mut Vec<StoreOp>, op: StoreOp) {
    match (ops.last_mut(), op) {
        (Some(StoreOp::Add(docs)), StoreOp::Add(more)) => docs.extend(more),
        (Some(StoreOp::Delete(queries)), StoreOp::Delete(more)) => queries.extend(more),
        (_, op) => ops.push(op),
    }
}

/// Counts for one batch, folded into the stats after commit.
#[derive(Debug, Default)]
struct BatchTally {
    added: u64,
    deleted: u64,
    rejected_documents: u64,
    rejected_queries: u64,
}

struct RunningTask {
    token: CancellationToken,
    handle: JoinHandle<Option<Box<dyn DocumentStore>>>,
}

struct Lifecycle {
    store: Option<Box<dyn DocumentStore>>,
    task: Option<RunningTask>,
}

pub struct QueueDispatcher {
    config: QueueConfig,
    dispatcher_config: DispatcherConfig,
    queue: Arc<DurableQueue>,
    coordinator: Arc<IndexingCoordinator>,
    stats: Arc<DispatcherStats>,
    state: RwLock<DispatcherState>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

impl QueueDispatcher {
    pub fn new(
        config: QueueConfig,
        dispatcher_config: DispatcherConfig,
        queue: Arc<DurableQueue>,
        coordinator: Arc<IndexingCoordinator>,
        store: Box<dyn DocumentStore>,
    ) -> Self {
        Self {
            config,
            dispatcher_config,
            queue,
            coordinator,
            stats: Arc::new(DispatcherStats::default()),
            state: RwLock::new(DispatcherState::Stopped),
            lifecycle: tokio::sync::Mutex::new(Lifecycle {
                store: Some(store),
                task: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<DurableQueue> {
        &self.queue
    }

    pub fn state(&self) -> DispatcherState {
        *self.state.read().expect("state lock poisoned")
    }

    pub fn is_running(&self) -> bool {
        self.state() == DispatcherState::Running
    }

    pub fn stats(&self) -> DispatcherStatsSnapshot {
        self.stats.snapshot()
    }

    fn set_state(&self, state: DispatcherState) {
        *self.state.write().expect("state lock poisoned") = state;
    }

    /// Spawn the dispatch loop.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` if started twice; `TaskFailed` if a previous run
    /// panicked and took the store client with it.
    pub async fn start(&self) -> Result<(), PipelineError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.task.is_some() {
            return Err(PipelineError::AlreadyRunning);
        }
        let store = lifecycle.store.take().ok_or_else(|| {
            PipelineError::TaskFailed(format!("queue {} has no store client", self.config.name))
        })?;
        self.set_state(DispatcherState::Starting);

        let released = self.queue.release_leases();
        if released > 0 {
            info!(queue = %self.config.name, released, "Released stale leases");
        }

        let token = CancellationToken::new();
        let worker = Worker {
            config: self.config.clone(),
            max_retries: self.dispatcher_config.max_retries,
            backoff: self.dispatcher_config.backoff(),
            queue: self.queue.clone(),
            stats: self.stats.clone(),
            writer: Some(BatchWriter {
                queue_name: self.config.name.clone(),
                coordinator: self.coordinator.clone(),
                store,
            }),
        };
        let handle = tokio::spawn(worker.run(token.clone()));
        lifecycle.task = Some(RunningTask { token, handle });
        self.set_state(DispatcherState::Running);
        Ok(())
    }

    /// Stop the loop and wait for the in-flight batch to finish.
    ///
    /// # Errors
    ///
    /// `NotRunning` if the dispatcher is stopped.
    pub async fn stop(&self) -> Result<(), PipelineError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let task = lifecycle.task.take().ok_or(PipelineError::NotRunning)?;
        self.set_state(DispatcherState::Stopping);
        info!(queue = %self.config.name, "Stopping dispatcher");

        task.token.cancel();
        let joined = task.handle.await;
        self.set_state(DispatcherState::Stopped);
        match joined {
            Ok(Some(store)) => {
                lifecycle.store = Some(store);
                Ok(())
            }
            Ok(None) => Err(PipelineError::TaskFailed(format!(
                "queue {} lost its store client",
                self.config.name
            ))),
            Err(e) => {
                error!(queue = %self.config.name, "Dispatcher task failed: {}", e);
                Err(PipelineError::TaskFailed(e.to_string()))
            }
        }
    }
}

/// State owned by the spawned dispatch loop.
struct Worker {
    config: QueueConfig,
    max_retries: u32,
    backoff: ExponentialBackoff,
    queue: Arc<DurableQueue>,
    stats: Arc<DispatcherStats>,
    /// Lent to a blocking task for the duration of each batch
    writer: Option<BatchWriter>,
}

impl Worker {
    async fn run(mut self, token: CancellationToken) -> Option<Box<dyn DocumentStore>> {
        info!(
            queue = %self.config.name,
            store = self.writer.as_ref().map(|w| w.store.name()).unwrap_or_default(),
            batch_size = self.config.batch_size,
            batch_delay_ms = self.config.batch_delay.as_millis() as u64,
            "Dispatcher started"
        );

        loop {
            let dequeued = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                batch = self.queue.dequeue_batch(self.config.batch_size, self.config.batch_delay) => batch,
            };

            let entries = match dequeued {
                Ok(entries) => entries,
                Err(e) => {
                    DispatcherStats::add(&self.stats.queue_errors, 1);
                    error!(queue = %self.config.name, "Dequeue failed: {}", e);
                    if !self.pause(&token).await {
                        break;
                    }
                    continue;
                }
            };
            if entries.is_empty() {
                continue;
            }

            DispatcherStats::add(&self.stats.batches, 1);
            let Some((entries, outcome)) = self.write_batch(entries).await else {
                break;
            };
            match outcome {
                Ok(tally) => {
                    self.backoff.reset();
                    self.record(&entries, tally);
                    if !self.acknowledge(&entries) && !self.pause(&token).await {
                        break;
                    }
                }
                Err(e) => {
                    self.retry_later(&entries, &e);
                    if !self.pause(&token).await {
                        break;
                    }
                }
            }
        }

        info!(queue = %self.config.name, "Dispatcher stopped");
        self.writer.map(|w| w.store)
    }

    /// Build, apply and commit one batch on the blocking pool. Returns
    /// `None` if the batch task panicked and took the store client with it.
    async fn write_batch(
        &mut self,
        entries: Vec<QueueEntry>,
    ) -> Option<(Vec<QueueEntry>, Result<BatchTally, StoreError>)> {
        let mut writer = self.writer.take()?;
        let joined = tokio::task::spawn_blocking(move || {
            let outcome = writer.write(&entries);
            (writer, entries, outcome)
        })
        .await;

        match joined {
            Ok((writer, entries, outcome)) => {
                self.writer = Some(writer);
                Some((entries, outcome))
            }
            Err(e) => {
                error!(queue = %self.config.name, "Batch task failed: {}", e);
                self.queue.release_leases();
                None
            }
        }
    }

    /// Wait out the next backoff interval. Returns false when cancelled.
    async fn pause(&mut self, token: &CancellationToken) -> bool {
        let delay = self
            .backoff
            .next_backoff()
            .unwrap_or(self.backoff.max_interval);
        debug!(queue = %self.config.name, delay_ms = delay.as_millis() as u64, "Backing off");
        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn record(&self, entries: &[QueueEntry], tally: BatchTally) {
        DispatcherStats::add(&self.stats.entries_committed, entries.len() as u64);
        DispatcherStats::add(&self.stats.documents_added, tally.added);
        DispatcherStats::add(&self.stats.delete_queries, tally.deleted);
        DispatcherStats::add(&self.stats.rejected_documents, tally.rejected_documents);
        DispatcherStats::add(&self.stats.rejected_queries, tally.rejected_queries);
        debug!(
            queue = %self.config.name,
            entries = entries.len(),
            added = tally.added,
            deleted = tally.deleted,
            "Committed batch"
        );
    }

    /// Returns false if the entries could not be acknowledged; they stay
    /// pending and are delivered again.
    fn acknowledge(&self, entries: &[QueueEntry]) -> bool {
        match self.queue.ack(entries) {
            Ok(_) => true,
            Err(e) => {
                DispatcherStats::add(&self.stats.queue_errors, 1);
                error!(queue = %self.config.name, "Ack failed, batch will be redelivered: {}", e);
                self.queue.release_leases();
                false
            }
        }
    }

    /// Requeue a batch the store did not take, dead-lettering entries that
    /// are out of retries. The store has already been rolled back.
    fn retry_later(&mut self, entries: &[QueueEntry], cause: &StoreError) {
        DispatcherStats::add(&self.stats.transient_failures, 1);

        let (expired, retry): (Vec<QueueEntry>, Vec<QueueEntry>) = entries
            .iter()
            .cloned()
            .partition(|entry| entry.retry_count >= self.max_retries);

        if !expired.is_empty() {
            for entry in &expired {
                error!(
                    queue = %self.config.name,
                    event_id = %entry.event.event_id,
                    topic = %entry.event.topic,
                    path = entry.event.path(),
                    retries = entry.retry_count,
                    data_loss = true,
                    "Dropping event after retry ceiling: {}",
                    cause
                );
            }
            let reason = format!("retry ceiling reached: {}", cause);
            match self.queue.dead_letter(&expired, &reason) {
                Ok(n) => DispatcherStats::add(&self.stats.dropped, n as u64),
                Err(e) => {
                    DispatcherStats::add(&self.stats.queue_errors, 1);
                    error!(queue = %self.config.name, "Dead-lettering failed: {}", e);
                    self.queue.release_leases();
                    return;
                }
            }
        }

        if !retry.is_empty() {
            match self.queue.requeue(&retry) {
                Ok(requeued) => {
                    DispatcherStats::add(&self.stats.requeued, requeued.len() as u64);
                    warn!(
                        queue = %self.config.name,
                        count = requeued.len(),
                        "Store failed, batch requeued: {}",
                        cause
                    );
                }
                Err(e) => {
                    DispatcherStats::add(&self.stats.queue_errors, 1);
                    error!(queue = %self.config.name, "Requeue failed: {}", e);
                    self.queue.release_leases();
                }
            }
        }
    }
}

/// The synchronous half of a batch: handler calls and store writes, which
/// may block on the repository or the index.
struct BatchWriter {
    queue_name: String,
    coordinator: Arc<IndexingCoordinator>,
    store: Box<dyn DocumentStore>,
}

impl BatchWriter {
    /// Apply and commit `entries`, rolling the store back on failure.
    fn write(&mut self, entries: &[QueueEntry]) -> Result<BatchTally, StoreError> {
        let outcome = self.apply(entries);
        if outcome.is_err() {
            if let Err(e) = self.store.rollback() {
                warn!(queue = %self.queue_name, "Rollback failed: {}", e);
            }
        }
        outcome
    }

    fn apply(&mut self, entries: &[QueueEntry]) -> Result<BatchTally, StoreError> {
        let mut ops = Vec::new();
        for entry in entries {
            let queries = self.coordinator.get_delete_queries(&entry.event);
            if !queries.is_empty() {
                push_op(&mut ops, StoreOp::Delete(queries));
            }
            let documents = self.coordinator.get_documents(&entry.event);
            if !documents.is_empty() {
                push_op(&mut ops, StoreOp::Add(documents));
            }
        }

        let mut tally = BatchTally::default();
        for op in &ops {
            match op {
                StoreOp::Add(documents) => self.add_documents(documents, &mut tally)?,
                StoreOp::Delete(queries) => self.delete_by_queries(queries, &mut tally)?,
            }
        }
        self.store.commit()?;
        Ok(tally)
    }

    fn add_documents(
        &mut self,
        documents: &[IndexDocument],
        tally: &mut BatchTally,
    ) -> Result<(), StoreError> {
        match self.store.add(documents) {
            Ok(()) => {
                tally.added += documents.len() as u64;
                Ok(())
            }
            Err(StoreError::Rejected { .. }) if documents.len() > 1 => {
                debug!(queue = %self.queue_name, "Batch add rejected, retrying one by one");
                for document in documents {
                    self.add_documents(slice::from_ref(document), tally)?;
                }
                Ok(())
            }
            Err(StoreError::Rejected { id, reason }) => {
                warn!(queue = %self.queue_name, id = %id, "Dropping rejected document: {}", reason);
                tally.rejected_documents += 1;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn delete_by_queries(
        &mut self,
        queries: &[String],
        tally: &mut BatchTally,
    ) -> Result<(), StoreError> {
        match self.store.delete_by_query(queries) {
            Ok(()) => {
                tally.deleted += queries.len() as u64;
                Ok(())
            }
            Err(StoreError::InvalidQuery { .. }) if queries.len() > 1 => {
                for query in queries {
                    self.delete_by_queries(slice::from_ref(query), tally)?;
                }
                Ok(())
            }
            Err(StoreError::InvalidQuery { query, reason }) => {
                warn!(queue = %self.queue_name, query = %query, "Dropping invalid delete query: {}", reason);
                tally.rejected_queries += 1;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
