//! Configuration for the content indexer.
//!
//! Loaded in layers, later layers winning:
//! 1. Built-in defaults
//! 2. `config.toml` in the platform config directory
//! 3. A file passed on the command line
//! 4. `INDEXER_*` environment variables
//!
//! CLI flags are applied by the caller afterwards.

use std::path::PathBuf;

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::event::default_content_topics;

/// One named durable queue and its latency class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSettings {
    pub name: String,
    /// Longest the dispatcher waits for a batch, also the routing threshold.
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_delay_ms() -> u64 {
    1000
}

fn default_batch_size() -> usize {
    100
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            batch_delay_ms: default_batch_delay_ms(),
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Directory holding one `indexq-<name>` database per queue
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Tantivy index directory
    #[serde(default = "default_search_index_path")]
    pub search_index_path: String,

    /// JSON snapshot loaded into the in-memory repository
    #[serde(default)]
    pub repository_snapshot: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Retry ceiling before an entry is dead-lettered
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Durable queues; empty means a single default queue
    #[serde(default)]
    pub queues: Vec<QueueSettings>,

    /// Topics the content router registers for
    #[serde(default = "default_content_topics")]
    pub content_topics: Vec<String>,

    /// Path prefixes that are never indexed
    #[serde(default = "default_ignored_path_prefixes")]
    pub ignored_path_prefixes: Vec<String>,

    /// Capacity of the cache of paths whose type has no handler
    #[serde(default = "default_ignore_cache_size")]
    pub ignore_cache_size: usize,

    /// Basic profile properties copied into user documents
    #[serde(default = "default_basic_profile_elements")]
    pub basic_profile_elements: Vec<String>,

    /// Tantivy writer heap in megabytes
    #[serde(default = "default_writer_memory_mb")]
    pub writer_memory_mb: usize,
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "content-indexer")
}

fn default_data_dir() -> String {
    project_dirs()
        .map(|p| p.data_local_dir().join("queues"))
        .unwrap_or_else(|| PathBuf::from("./queues"))
        .to_string_lossy()
        .to_string()
}

fn default_search_index_path() -> String {
    project_dirs()
        .map(|p| p.data_local_dir().join("search-index"))
        .unwrap_or_else(|| PathBuf::from("./search-index"))
        .to_string_lossy()
        .to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_retries() -> u32 {
    25
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_ignored_path_prefixes() -> Vec<String> {
    ["/dev/", "/devwidgets/", "/jsdoc/", "/var/", "/tests/", "/apps/"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_ignore_cache_size() -> usize {
    500
}

fn default_basic_profile_elements() -> Vec<String> {
    ["firstName", "lastName", "email", "picture", "role", "department", "college"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_writer_memory_mb() -> usize {
    50
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            search_index_path: default_search_index_path(),
            repository_snapshot: None,
            log_level: default_log_level(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            queues: Vec::new(),
            content_topics: default_content_topics(),
            ignored_path_prefixes: default_ignored_path_prefixes(),
            ignore_cache_size: default_ignore_cache_size(),
            basic_profile_elements: default_basic_profile_elements(),
            writer_memory_mb: default_writer_memory_mb(),
        }
    }
}

impl Settings {
    /// Load settings from defaults, config files and the environment.
    pub fn load(cli_config_path: Option<&str>) -> Result<Self, IndexerError> {
        let config_dir = project_dirs()
            .map(|p| p.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        let default_config_path = config_dir.join("config");

        let mut builder = Config::builder()
            .set_default("data_dir", default_data_dir())
            .map_err(|e| IndexerError::Config(e.to_string()))?
            .set_default("search_index_path", default_search_index_path())
            .map_err(|e| IndexerError::Config(e.to_string()))?
            .set_default("log_level", default_log_level())
            .map_err(|e| IndexerError::Config(e.to_string()))?
            .set_default("max_retries", default_max_retries() as i64)
            .map_err(|e| IndexerError::Config(e.to_string()))?
            .add_source(File::with_name(&default_config_path.to_string_lossy()).required(false));

        if let Some(path) = cli_config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // INDEXER_DATA_DIR, INDEXER_MAX_RETRIES, INDEXER_LOG_LEVEL, ...
        builder = builder.add_source(
            Environment::with_prefix("INDEXER")
                .prefix_separator("_")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| IndexerError::Config(e.to_string()))?;

        let settings: Settings = config
            .try_deserialize()
            .map_err(|e| IndexerError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.initial_backoff_ms == 0 {
            return Err(IndexerError::Config(
                "initial_backoff_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(IndexerError::Config(
                "max_backoff_ms must not be below initial_backoff_ms".to_string(),
            ));
        }
        for queue in &self.queues {
            if queue.name.is_empty() {
                return Err(IndexerError::Config("queue name is empty".to_string()));
            }
            if queue.batch_size == 0 {
                return Err(IndexerError::Config(format!(
                    "queue {} has batch_size 0",
                    queue.name
                )));
            }
        }
        Ok(())
    }

    /// Configured queues, or a single default queue.
    pub fn effective_queues(&self) -> Vec<QueueSettings> {
        if self.queues.is_empty() {
            vec![QueueSettings::default()]
        } else {
            self.queues.clone()
        }
    }

    pub fn data_dir_path(&self) -> PathBuf {
        expand_home(&self.data_dir)
    }

    pub fn search_index_dir(&self) -> PathBuf {
        expand_home(&self.search_index_path)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.max_retries, 25);
        assert_eq!(settings.ignore_cache_size, 500);
        assert_eq!(settings.content_topics.len(), 3);
        assert!(settings.ignored_path_prefixes.contains(&"/var/".to_string()));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_effective_queues_defaults_to_one() {
        let settings = Settings::default();
        let queues = settings.effective_queues();
        assert_eq!(queues.len(), 1);
        assert_eq!(queues[0].name, "default");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("indexer.toml");
        std::fs::write(
            &file,
            r#"
max_retries = 3

[[queues]]
name = "zippy"
batch_delay_ms = 50
batch_size = 10

[[queues]]
name = "loafing"
batch_delay_ms = 5000
"#,
        )
        .unwrap();

        let settings = Settings::load(Some(file.to_str().unwrap())).unwrap();
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.queues.len(), 2);
        assert_eq!(settings.queues[1].batch_size, 100);
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut settings = Settings::default();
        settings.queues.push(QueueSettings {
            name: "q".to_string(),
            batch_delay_ms: 10,
            batch_size: 0,
        });
        assert!(settings.validate().is_err());
    }
}
