//! Command implementations for the indexer daemon.
//!
//! Handles:
//! - run: Load config, open queues and the search index, start dispatchers,
//!   feed stdin events until end of input or a shutdown signal
//! - submit: Durably enqueue one event
//! - status: Queue depth and dead-letter counts
//! - dead-letters: Inspect events dropped after their retries ran out

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{debug, info, warn};

use indexer_handlers::{
    register_builtin_handlers, CoordinatorConfig, IndexingCoordinator, RepositorySession,
};
use indexer_pipeline::{DispatcherConfig, IndexingService, PipelineError, QueueConfig};
use indexer_search::{
    ContentIndex, DocumentStore, MemoryDocumentStore, SearchIndexConfig, TantivyDocumentStore,
};
use indexer_types::{MemoryRepository, MutationEvent, Settings, PROP_PATH, PROP_RESOURCE_TYPE};

use crate::cli::StorageArgs;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One line of `run` input.
#[derive(Debug, Deserialize)]
pub struct IncomingEvent {
    pub topic: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

/// Load configuration and apply CLI overrides (highest precedence).
fn load_settings(
    config_path: Option<&str>,
    log_level_override: Option<&str>,
    storage: &StorageArgs,
) -> Result<Settings> {
    let mut settings = Settings::load(config_path).context("Failed to load configuration")?;

    if let Some(data_dir) = &storage.data_dir {
        settings.data_dir = data_dir.clone();
    }
    if let Some(index_path) = &storage.index_path {
        settings.search_index_path = index_path.clone();
    }
    if let Some(snapshot) = &storage.snapshot {
        settings.repository_snapshot = Some(snapshot.clone());
    }
    if let Some(log_level) = log_level_override {
        settings.log_level = log_level.to_string();
    }
    Ok(settings)
}

/// Logs go to stderr so command output on stdout stays parseable.
fn init_logging(settings: &Settings) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.log_level)),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;
    Ok(())
}

/// Queue definitions from `--queue` specs, falling back to the configured queues.
pub fn queue_configs(settings: &Settings, specs: &[String]) -> Result<Vec<QueueConfig>> {
    if specs.is_empty() {
        return Ok(settings
            .effective_queues()
            .iter()
            .map(QueueConfig::from)
            .collect());
    }
    specs
        .iter()
        .map(|spec| {
            spec.parse::<QueueConfig>()
                .with_context(|| format!("Invalid queue definition: {}", spec))
        })
        .collect()
}

/// Build the coordinator over the configured repository snapshot, with the
/// built-in handlers registered and content routing active.
pub fn build_coordinator(settings: &Settings) -> Result<Arc<IndexingCoordinator>> {
    let repository = match &settings.repository_snapshot {
        Some(path) => MemoryRepository::load(Path::new(path))
            .with_context(|| format!("Failed to load repository snapshot {}", path))?,
        None => {
            warn!("No repository snapshot configured, indexing against an empty repository");
            MemoryRepository::new()
        }
    };
    let session = RepositorySession::from_shared(Arc::new(repository));
    let coordinator = Arc::new(IndexingCoordinator::new(
        session,
        CoordinatorConfig::from_settings(settings),
    ));
    register_builtin_handlers(&coordinator, settings);
    Ok(coordinator)
}

/// Open the queues without a search index. Nothing is indexed through the
/// placeholder stores because the dispatchers are never started.
fn open_queues_only(settings: &Settings) -> Result<IndexingService> {
    let queues = queue_configs(settings, &[])?;
    let coordinator = build_coordinator(settings)?;
    IndexingService::open(
        &settings.data_dir_path(),
        queues,
        DispatcherConfig::from_settings(settings),
        coordinator,
        |queue| Ok(Box::new(MemoryDocumentStore::new(queue.name.clone())) as Box<dyn DocumentStore>),
    )
    .context("Failed to open queues (is the daemon running?)")
}

/// Parse a `key=value` property. Values that are valid JSON keep their type.
pub fn parse_property(raw: &str) -> Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("Property must look like key=value: {}", raw))?;
    let key = key.trim();
    if key.is_empty() {
        anyhow::bail!("Property has an empty key: {}", raw);
    }
    let value =
        serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Parse one JSON line of input. Blank lines yield `None`.
pub fn parse_event_line(line: &str) -> Result<Option<IncomingEvent>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let event = serde_json::from_str(line).context("Malformed event line")?;
    Ok(Some(event))
}

/// Submit every event read from `reader`. Malformed or rejected events are
/// logged and skipped. Returns the number of accepted events.
pub async fn ingest<R>(service: &IndexingService, reader: R) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut accepted = 0;
    while let Some(line) = lines.next_line().await.context("Failed to read events")? {
        let event = match parse_event_line(&line) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "Skipping event line");
                continue;
            }
        };
        match service.submit(&event.topic, event.properties) {
            Ok(entry) => {
                accepted += 1;
                debug!(topic = %event.topic, sequence = entry.sequence, "Event queued");
            }
            Err(e) => warn!(topic = %event.topic, error = %e, "Event rejected"),
        }
    }
    Ok(accepted)
}

/// Wait until every queue is empty.
pub async fn drain(service: &IndexingService) {
    while service.total_backlog() > 0 {
        tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

/// Run the indexer.
///
/// 1. Load configuration (defaults -> file -> env -> CLI)
/// 2. Open the search index and one durable queue per configured queue
/// 3. Start the dispatchers; events left from a previous run are replayed
/// 4. Read JSON-lines events from stdin
/// 5. On end of input drain the queues; on SIGINT/SIGTERM stop right away
pub async fn run_daemon(
    config_path: Option<&str>,
    log_level_override: Option<&str>,
    storage: &StorageArgs,
    queue_specs: &[String],
) -> Result<()> {
    let settings = load_settings(config_path, log_level_override, storage)?;
    init_logging(&settings)?;

    info!("Indexer daemon starting...");
    info!("Configuration:");
    info!("  Queue directory: {:?}", settings.data_dir_path());
    info!("  Search index: {:?}", settings.search_index_dir());
    info!("  Log level: {}", settings.log_level);

    let queues = queue_configs(&settings, queue_specs)?;
    let coordinator = build_coordinator(&settings)?;

    let index = ContentIndex::open_or_create(
        SearchIndexConfig::new(settings.search_index_dir())
            .with_memory_mb(settings.writer_memory_mb),
    )
    .context("Failed to open search index")?;
    let store = TantivyDocumentStore::new(&index);

    let service = IndexingService::open(
        &settings.data_dir_path(),
        queues,
        DispatcherConfig::from_settings(&settings),
        coordinator,
        |queue| Ok(Box::new(store.handle(queue.name.clone())) as Box<dyn DocumentStore>),
    )
    .context("Failed to open queues")?;

    service
        .start()
        .await
        .context("Failed to start dispatchers")?;

    let ingested = tokio::select! {
        result = ingest(&service, BufReader::new(tokio::io::stdin())) => result.map(Some),
        _ = shutdown_signal() => Ok(None),
    };

    if let Ok(Some(accepted)) = &ingested {
        info!(accepted, backlog = service.total_backlog(), "End of input, draining queues");
        tokio::select! {
            _ = drain(&service) => info!("Queues drained"),
            _ = shutdown_signal() => {}
        }
    }

    match service.stop().await {
        Ok(()) | Err(PipelineError::NotRunning) => {}
        Err(e) => return Err(e).context("Failed to stop dispatchers"),
    }

    info!(documents = index.num_docs().unwrap_or_default(), "Indexer daemon stopped");
    println!("{}", serde_json::to_string_pretty(&service.stats())?);

    ingested.map(|_| ())
}

/// Durably enqueue one event for a later `run`.
pub fn submit_event(
    config_path: Option<&str>,
    log_level_override: Option<&str>,
    storage: &StorageArgs,
    topic: &str,
    path: &str,
    resource_type: Option<&str>,
    props: &[String],
) -> Result<()> {
    let settings = load_settings(config_path, log_level_override, storage)?;
    init_logging(&settings)?;

    let mut properties = BTreeMap::new();
    for raw in props {
        let (key, value) = parse_property(raw)?;
        properties.insert(key, value);
    }
    properties.insert(PROP_PATH.to_string(), Value::String(path.to_string()));
    if let Some(resource_type) = resource_type {
        properties.insert(
            PROP_RESOURCE_TYPE.to_string(),
            Value::String(resource_type.to_string()),
        );
    }
    let event = MutationEvent::new(topic, properties).context("Invalid event")?;

    let service = open_queues_only(&settings)?;
    let queue = service.queue_for(service.effective_ttl(&event)).to_string();
    let entry = service.submit_event(event).context("Failed to enqueue event")?;
    println!("Queued {} {} on {} (sequence {})", topic, path, queue, entry.sequence);
    Ok(())
}

/// Print per-queue depth and dead-letter counts.
pub fn show_status(
    config_path: Option<&str>,
    log_level_override: Option<&str>,
    storage: &StorageArgs,
) -> Result<()> {
    let settings = load_settings(config_path, log_level_override, storage)?;
    init_logging(&settings)?;

    let service = open_queues_only(&settings)?;
    println!("Queue directory: {:?}", settings.data_dir_path());
    println!(
        "{:<16} {:>10} {:>10} {:>12}",
        "QUEUE", "DELAY_MS", "PENDING", "DEAD_LETTERS"
    );
    for backlog in service.backlog() {
        println!(
            "{:<16} {:>10} {:>10} {:>12}",
            backlog.name, backlog.batch_delay_ms, backlog.depth, backlog.dead_letters
        );
    }
    Ok(())
}

/// Print dead-lettered events of one queue as JSON lines.
pub fn show_dead_letters(
    config_path: Option<&str>,
    log_level_override: Option<&str>,
    storage: &StorageArgs,
    queue: &str,
    limit: usize,
) -> Result<()> {
    let settings = load_settings(config_path, log_level_override, storage)?;
    init_logging(&settings)?;

    let service = open_queues_only(&settings)?;
    let letters = service
        .dead_letters(queue, limit)
        .with_context(|| format!("Failed to read dead letters of {}", queue))?;
    if letters.is_empty() {
        println!("No dead letters in {}", queue);
        return Ok(());
    }
    for letter in letters {
        println!("{}", serde_json::to_string(&letter)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn settings_in(dir: &TempDir) -> Settings {
        Settings {
            data_dir: dir.path().join("queues").to_string_lossy().to_string(),
            search_index_path: dir.path().join("index").to_string_lossy().to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_property() {
        assert_eq!(parse_property("ttl=100").unwrap(), ("ttl".to_string(), json!(100)));
        assert_eq!(
            parse_property("title=hello world").unwrap(),
            ("title".to_string(), json!("hello world"))
        );
        assert_eq!(
            parse_property("tags=[\"a\",\"b\"]").unwrap(),
            ("tags".to_string(), json!(["a", "b"]))
        );
        assert_eq!(
            parse_property("expr=a=b").unwrap(),
            ("expr".to_string(), json!("a=b"))
        );
        assert!(parse_property("novalue").is_err());
        assert!(parse_property("=x").is_err());
    }

    #[test]
    fn test_parse_event_line() {
        assert!(parse_event_line("   ").unwrap().is_none());
        let event = parse_event_line(r#"{"topic":"content/ADDED","properties":{"path":"/a"}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(event.topic, "content/ADDED");
        assert_eq!(event.properties.get("path"), Some(&json!("/a")));

        let bare = parse_event_line(r#"{"topic":"content/DELETE"}"#).unwrap().unwrap();
        assert!(bare.properties.is_empty());

        assert!(parse_event_line("not json").is_err());
    }

    #[test]
    fn test_queue_configs_from_specs_and_settings() {
        let dir = TempDir::new().unwrap();
        let settings = settings_in(&dir);

        let defaults = queue_configs(&settings, &[]).unwrap();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].name, "default");

        let specs = vec![
            "name=zippy;batch-delay=50;batched-index-size=10".to_string(),
            "name=loafing;batch-delay=200".to_string(),
        ];
        let queues = queue_configs(&settings, &specs).unwrap();
        assert_eq!(queues[0].name, "zippy");
        assert_eq!(queues[0].batch_delay, Duration::from_millis(50));
        assert_eq!(queues[0].batch_size, 10);
        assert_eq!(queues[1].name, "loafing");

        assert!(queue_configs(&settings, &["name=x;bogus=1".to_string()]).is_err());
    }

    #[test]
    fn test_build_coordinator_registers_builtins() {
        let dir = TempDir::new().unwrap();
        let settings = settings_in(&dir);
        let coordinator = build_coordinator(&settings).unwrap();
        assert!(!coordinator.active_topics().is_empty());
        assert!(coordinator.registry().has_handlers("authorizables/ADDED"));
    }

    #[test]
    fn test_build_coordinator_missing_snapshot_fails() {
        let dir = TempDir::new().unwrap();
        let mut settings = settings_in(&dir);
        settings.repository_snapshot =
            Some(dir.path().join("missing.json").to_string_lossy().to_string());
        assert!(build_coordinator(&settings).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ingest_skips_bad_lines() {
        let dir = TempDir::new().unwrap();
        let settings = settings_in(&dir);
        let service = open_queues_only(&settings).unwrap();

        let input = concat!(
            "{\"topic\":\"content/ADDED\",\"properties\":{\"path\":\"/docs/a\"}}\n",
            "\n",
            "garbage\n",
            "{\"topic\":\"content/ADDED\",\"properties\":{}}\n",
            "{\"topic\":\"content/UPDATED\",\"properties\":{\"path\":\"/docs/b\"}}\n",
        );
        let accepted = ingest(&service, input.as_bytes()).await.unwrap();
        assert_eq!(accepted, 2);
        assert_eq!(service.total_backlog(), 2);
    }

    #[test]
    fn test_queues_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let settings = settings_in(&dir);
        {
            let service = open_queues_only(&settings).unwrap();
            service
                .submit_event(MutationEvent::for_path("content/ADDED", "/docs/a"))
                .unwrap();
        }
        let service = open_queues_only(&settings).unwrap();
        assert_eq!(service.total_backlog(), 1);
        assert_eq!(service.backlog()[0].dead_letters, 0);
    }
}
