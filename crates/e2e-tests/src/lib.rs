//! End-to-end test infrastructure for the content indexer.
//!
//! Provides a shared TestHarness and helpers for tests covering the whole
//! submit -> queue -> dispatcher -> handlers -> store pipeline.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexer_handlers::{
    register_builtin_handlers, BuiltinHandlers, CoordinatorConfig, IndexingCoordinator,
    RepositorySession,
};
use indexer_pipeline::{DispatcherConfig, IndexingService, QueueConfig};
use indexer_search::{DocumentStore, MemoryDocumentStore, StoreError};
use indexer_types::{
    default_content_topics, Entity, IndexDocument, MemoryRepository, MutationEvent, Settings,
    TopicList,
};

/// Shared test harness for E2E tests.
///
/// Owns the temp directory, an in-memory repository and a coordinator with
/// content routing active on the default topics.
pub struct TestHarness {
    /// Keeps temp dir alive for the lifetime of the harness
    pub _temp_dir: tempfile::TempDir,
    pub repo: Arc<MemoryRepository>,
    pub coordinator: Arc<IndexingCoordinator>,
    /// Parent directory of the `indexq-*` queue databases
    pub data_dir: PathBuf,
    /// Path for Tantivy index files
    pub index_path: PathBuf,
}

impl TestHarness {
    /// Harness without built-in handlers; content falls back to the
    /// generic content handler.
    pub fn new() -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let repo = Arc::new(MemoryRepository::new());
        let coordinator = Arc::new(IndexingCoordinator::new(
            RepositorySession::from_shared(repo.clone()),
            CoordinatorConfig::default(),
        ));
        coordinator.activate(TopicList::from_topics(default_content_topics()));

        let data_dir = temp_dir.path().join("queues");
        let index_path = temp_dir.path().join("search-index");

        Self {
            _temp_dir: temp_dir,
            repo,
            coordinator,
            data_dir,
            index_path,
        }
    }

    /// Harness with the authorizable, profile and tag handlers registered.
    pub fn with_builtins() -> (Self, BuiltinHandlers) {
        let harness = Self::new();
        let builtins = register_builtin_handlers(&harness.coordinator, &Settings::default());
        (harness, builtins)
    }

    /// Open the service with one store per queue from `factory`.
    pub fn open_service<F>(
        &self,
        queues: Vec<QueueConfig>,
        dispatcher_config: DispatcherConfig,
        mut factory: F,
    ) -> IndexingService
    where
        F: FnMut(&QueueConfig) -> Box<dyn DocumentStore>,
    {
        IndexingService::open(
            &self.data_dir,
            queues,
            dispatcher_config,
            self.coordinator.clone(),
            |queue| Ok(factory(queue)),
        )
        .expect("Failed to open indexing service")
    }

    /// Open the service with every queue writing to clones of `store`.
    pub fn open_memory_service(
        &self,
        queues: Vec<QueueConfig>,
        store: &MemoryDocumentStore,
    ) -> IndexingService {
        self.open_service(queues, fast_retries(), |_| Box::new(store.clone()))
    }

    /// Open the service with every queue writing through a [`FlakyStore`].
    pub fn open_flaky_service(
        &self,
        queues: Vec<QueueConfig>,
        dispatcher_config: DispatcherConfig,
        store: &MemoryDocumentStore,
        faults: &Arc<FaultPlan>,
    ) -> IndexingService {
        self.open_service(queues, dispatcher_config, |_| {
            Box::new(FlakyStore::new(store.clone(), faults.clone()))
        })
    }

    /// Store a content entity with a title.
    pub fn put_content(&self, path: &str, resource_type: &str, title: &str) {
        self.repo.put_entity(
            Entity::new(path)
                .with_resource_type(resource_type)
                .with_property("title", title),
        );
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Retry pacing short enough for tests.
pub fn fast_retries() -> DispatcherConfig {
    DispatcherConfig::default().with_backoff(Duration::from_millis(5), Duration::from_millis(50))
}

/// A single queue with a short batch delay.
pub fn single_queue(batch_size: usize) -> Vec<QueueConfig> {
    vec![QueueConfig::new("default", Duration::from_millis(10), batch_size)]
}

/// The three queues used for staleness routing tests.
pub fn routing_queues() -> Vec<QueueConfig> {
    vec![
        QueueConfig::new("loafing", Duration::from_millis(200), 50),
        QueueConfig::new("moderate", Duration::from_millis(100), 50),
        QueueConfig::new("zippy", Duration::from_millis(50), 50),
    ]
}

pub fn content_event(topic: &str, path: &str) -> MutationEvent {
    MutationEvent::for_path(topic, path)
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until every queue of the service is empty.
pub async fn wait_for_drain(service: &IndexingService, timeout: Duration) -> bool {
    wait_until(timeout, || service.total_backlog() == 0).await
}

/// Failures to inject into a [`FlakyStore`].
///
/// Call numbers are 1-based and counted across every store sharing the plan.
#[derive(Debug, Default)]
pub struct FaultPlan {
    failing_add_calls: HashSet<u64>,
    failing_commits: AtomicU32,
    always_fail: bool,
    add_calls: AtomicU64,
    commit_calls: AtomicU64,
    injected: AtomicU64,
}

impl FaultPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the given `add` calls with a transient error.
    pub fn fail_add_calls(mut self, calls: &[u64]) -> Self {
        self.failing_add_calls.extend(calls.iter().copied());
        self
    }

    /// Fail the first `n` commits with a transient error.
    pub fn fail_first_commits(self, n: u32) -> Self {
        self.failing_commits.store(n, Ordering::SeqCst);
        self
    }

    /// Fail every commit.
    pub fn always_fail(mut self) -> Self {
        self.always_fail = true;
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn add_calls(&self) -> u64 {
        self.add_calls.load(Ordering::SeqCst)
    }

    pub fn commit_calls(&self) -> u64 {
        self.commit_calls.load(Ordering::SeqCst)
    }

    /// Number of failures injected so far.
    pub fn injected(&self) -> u64 {
        self.injected.load(Ordering::SeqCst)
    }

    fn fail(&self, what: &str) -> Result<(), StoreError> {
        self.injected.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Unavailable(format!("injected {} failure", what)))
    }
}

/// Store wrapper failing on a [`FaultPlan`].
pub struct FlakyStore<S = MemoryDocumentStore> {
    inner: S,
    faults: Arc<FaultPlan>,
}

impl<S: DocumentStore> FlakyStore<S> {
    pub fn new(inner: S, faults: Arc<FaultPlan>) -> Self {
        Self { inner, faults }
    }
}

impl<S: DocumentStore> DocumentStore for FlakyStore<S> {
    fn name(&self) -> &str {
        "flaky"
    }

    fn add(&mut self, documents: &[IndexDocument]) -> Result<(), StoreError> {
        let call = self.faults.add_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.faults.failing_add_calls.contains(&call) {
            return self.faults.fail("add");
        }
        self.inner.add(documents)
    }

    fn delete_by_query(&mut self, queries: &[String]) -> Result<(), StoreError> {
        self.inner.delete_by_query(queries)
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.faults.commit_calls.fetch_add(1, Ordering::SeqCst);
        let scheduled = self
            .faults
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if self.faults.always_fail || scheduled {
            return self.faults.fail("commit");
        }
        self.inner.commit()
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.inner.rollback()
    }
}
