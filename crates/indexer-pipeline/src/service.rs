//! Indexing service: the durable queues, their dispatchers and the ingress.
//!
//! Producers call [`IndexingService::submit`], which only validates the
//! event, picks a queue by staleness tolerance and persists it. Indexing
//! happens later on the dispatcher tasks.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use indexer_handlers::{CoordinatorStatsSnapshot, IndexingCoordinator};
use indexer_search::DocumentStore;
use indexer_storage::{DeadLetter, DurableQueue};
use indexer_types::{MutationEvent, QueueEntry};

use crate::config::{DispatcherConfig, QueueConfig};
use crate::dispatcher::{DispatcherState, QueueDispatcher};
use crate::error::PipelineError;
use crate::stats::DispatcherStatsSnapshot;

/// Pending work of one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueBacklog {
    pub name: String,
    pub batch_delay_ms: u64,
    pub depth: u64,
    pub in_flight: u64,
    pub dead_letters: u64,
    pub state: DispatcherState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueReport {
    pub backlog: QueueBacklog,
    pub dispatcher: DispatcherStatsSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStats {
    pub queues: Vec<QueueReport>,
    pub coordinator: CoordinatorStatsSnapshot,
}

pub struct IndexingService {
    coordinator: Arc<IndexingCoordinator>,
    /// Ordered by batch delay, fastest first
    dispatchers: Vec<QueueDispatcher>,
}

impl IndexingService {
    /// Open one durable queue and dispatcher per queue config under
    /// `data_dir`. An empty list opens a single default queue.
    ///
    /// `store_factory` is called once per queue for that queue's store client.
    pub fn open<F>(
        data_dir: &Path,
        queues: Vec<QueueConfig>,
        dispatcher_config: DispatcherConfig,
        coordinator: Arc<IndexingCoordinator>,
        mut store_factory: F,
    ) -> Result<Self, PipelineError>
    where
        F: FnMut(&QueueConfig) -> Result<Box<dyn DocumentStore>, PipelineError>,
    {
        let mut queues = if queues.is_empty() {
            vec![QueueConfig::default()]
        } else {
            queues
        };
        let mut names = HashSet::new();
        for queue in &queues {
            queue.validate()?;
            if !names.insert(queue.name.clone()) {
                return Err(PipelineError::Config(format!(
                    "queue {} is configured twice",
                    queue.name
                )));
            }
        }
        queues.sort_by_key(|q| q.batch_delay);

        std::fs::create_dir_all(data_dir).map_err(|e| {
            PipelineError::Config(format!("cannot create {}: {}", data_dir.display(), e))
        })?;

        let mut dispatchers = Vec::with_capacity(queues.len());
        for config in queues {
            let queue = Arc::new(DurableQueue::open(
                &data_dir.join(config.directory_name()),
                &config.name,
            )?);
            if !queue.is_empty() {
                info!(queue = %config.name, depth = queue.depth(), "Replaying unacknowledged events");
            }
            let store = store_factory(&config)?;
            dispatchers.push(QueueDispatcher::new(
                config,
                dispatcher_config.clone(),
                queue,
                coordinator.clone(),
                store,
            ));
        }

        info!(
            queues = ?dispatchers.iter().map(|d| d.name()).collect::<Vec<_>>(),
            "Indexing service opened"
        );
        Ok(Self {
            coordinator,
            dispatchers,
        })
    }

    pub fn coordinator(&self) -> &Arc<IndexingCoordinator> {
        &self.coordinator
    }

    pub fn dispatchers(&self) -> &[QueueDispatcher] {
        &self.dispatchers
    }

    pub fn dispatcher(&self, name: &str) -> Option<&QueueDispatcher> {
        self.dispatchers.iter().find(|d| d.name() == name)
    }

    /// Validate and durably enqueue an event.
    pub fn submit(
        &self,
        topic: &str,
        properties: BTreeMap<String, Value>,
    ) -> Result<QueueEntry, PipelineError> {
        let event = MutationEvent::new(topic, properties)?;
        self.submit_event(event)
    }

    pub fn submit_event(&self, event: MutationEvent) -> Result<QueueEntry, PipelineError> {
        if event.topic.is_empty() || event.path().is_empty() {
            return Err(PipelineError::InvalidEvent(format!(
                "event {} has no topic or path",
                event.event_id
            )));
        }
        let ttl = self.effective_ttl(&event);
        let dispatcher = self.route(ttl);
        let entry = dispatcher.queue().enqueue(event)?;
        debug!(
            queue = dispatcher.name(),
            event_id = %entry.event.event_id,
            topic = %entry.event.topic,
            ttl_ms = ttl.map(|t| t.as_millis() as u64),
            "Submitted event"
        );
        Ok(entry)
    }

    /// Smaller of the event's own `ttl` and what its handlers ask for.
    pub fn effective_ttl(&self, event: &MutationEvent) -> Option<Duration> {
        match (event.ttl(), self.coordinator.get_ttl(event)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Name of the queue an event with this TTL lands in.
    pub fn queue_for(&self, ttl: Option<Duration>) -> &str {
        self.route(ttl).name()
    }

    /// The slowest queue whose batch delay fits in `ttl`, else the fastest
    /// queue. Without a TTL, the slowest queue.
    fn route(&self, ttl: Option<Duration>) -> &QueueDispatcher {
        let fastest = &self.dispatchers[0];
        match ttl {
            None => self.dispatchers.last().unwrap_or(fastest),
            Some(ttl) => self
                .dispatchers
                .iter()
                .rev()
                .find(|d| d.config().batch_delay <= ttl)
                .unwrap_or(fastest),
        }
    }

    /// Start every dispatcher. If one fails, the ones started by this call
    /// are stopped again before the error is returned.
    pub async fn start(&self) -> Result<(), PipelineError> {
        for (i, dispatcher) in self.dispatchers.iter().enumerate() {
            if let Err(e) = dispatcher.start().await {
                warn!(queue = dispatcher.name(), "Dispatcher failed to start: {}", e);
                for started in &self.dispatchers[..i] {
                    if let Err(stop_err) = started.stop().await {
                        warn!(queue = started.name(), "Dispatcher did not stop cleanly: {}", stop_err);
                    }
                }
                return Err(e);
            }
        }
        info!(queues = self.dispatchers.len(), "Indexing service started");
        Ok(())
    }

    /// Stop every dispatcher, waiting for in-flight batches, then flush the
    /// queues. Returns the first failure after trying all of them.
    pub async fn stop(&self) -> Result<(), PipelineError> {
        let mut stopped = 0;
        let mut first_error = None;
        for dispatcher in &self.dispatchers {
            match dispatcher.stop().await {
                Ok(()) => stopped += 1,
                Err(PipelineError::NotRunning) => {}
                Err(e) => {
                    warn!(queue = dispatcher.name(), "Dispatcher did not stop cleanly: {}", e);
                    first_error.get_or_insert(e);
                }
            }
            if let Err(e) = dispatcher.queue().flush() {
                warn!(queue = dispatcher.name(), "Queue flush failed: {}", e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        if stopped == 0 {
            return Err(PipelineError::NotRunning);
        }
        info!(backlog = self.total_backlog(), "Indexing service stopped");
        Ok(())
    }

    pub fn backlog(&self) -> Vec<QueueBacklog> {
        self.dispatchers
            .iter()
            .map(|d| {
                let stats = d.queue().stats();
                QueueBacklog {
                    name: stats.name,
                    batch_delay_ms: d.config().batch_delay.as_millis() as u64,
                    depth: stats.depth,
                    in_flight: stats.in_flight,
                    dead_letters: stats.dead_letters,
                    state: d.state(),
                }
            })
            .collect()
    }

    /// Events accepted but not yet acknowledged, across all queues.
    pub fn total_backlog(&self) -> u64 {
        self.dispatchers.iter().map(|d| d.queue().depth()).sum()
    }

    pub fn stats(&self) -> ServiceStats {
        let queues = self
            .backlog()
            .into_iter()
            .zip(&self.dispatchers)
            .map(|(backlog, d)| QueueReport {
                backlog,
                dispatcher: d.stats(),
            })
            .collect();
        ServiceStats {
            queues,
            coordinator: self.coordinator.stats(),
        }
    }

    pub fn dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetter>, PipelineError> {
        let dispatcher = self
            .dispatcher(queue)
            .ok_or_else(|| PipelineError::Config(format!("no queue named {}", queue)))?;
        Ok(dispatcher.queue().dead_letters(limit)?)
    }
}
