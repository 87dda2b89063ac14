//! Queue and dispatcher configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};

use indexer_types::{QueueSettings, Settings};

use crate::error::PipelineError;

/// One durable queue and the pacing of its dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    /// Longest wait for a batch to fill; also the routing threshold
    pub batch_delay: Duration,
    pub batch_size: usize,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, batch_delay: Duration, batch_size: usize) -> Self {
        Self {
            name: name.into(),
            batch_delay,
            batch_size,
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.name.is_empty() {
            return Err(PipelineError::Config("queue name is empty".to_string()));
        }
        if self.name.contains(|c: char| c == '/' || c == '\\') {
            return Err(PipelineError::Config(format!(
                "queue name {} contains a path separator",
                self.name
            )));
        }
        if self.batch_size == 0 {
            return Err(PipelineError::Config(format!(
                "queue {} has batch size 0",
                self.name
            )));
        }
        Ok(())
    }

    /// Directory name of the queue's database under the data directory.
    pub fn directory_name(&self) -> String {
        format!("indexq-{}", self.name)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::from(&QueueSettings::default())
    }
}

impl From<&QueueSettings> for QueueConfig {
    fn from(settings: &QueueSettings) -> Self {
        Self {
            name: settings.name.clone(),
            batch_delay: Duration::from_millis(settings.batch_delay_ms),
            batch_size: settings.batch_size,
        }
    }
}

/// Parses `name=zippy;batch-delay=50;batched-index-size=10`.
///
/// `batch-delay` is in milliseconds. `near-real-time` is accepted and
/// ignored; any other key is an error.
impl FromStr for QueueConfig {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let defaults = QueueSettings::default();
        let mut name = None;
        let mut batch_delay = Duration::from_millis(defaults.batch_delay_ms);
        let mut batch_size = defaults.batch_size;

        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once('=').ok_or_else(|| {
                PipelineError::Config(format!("expected key=value, got '{}'", part))
            })?;
            let value = value.trim();
            match key.trim() {
                "name" => name = Some(value.to_string()),
                "batch-delay" => {
                    let ms = value.parse::<u64>().map_err(|e| {
                        PipelineError::Config(format!("batch-delay '{}': {}", value, e))
                    })?;
                    batch_delay = Duration::from_millis(ms);
                }
                "batched-index-size" => {
                    batch_size = value.parse::<usize>().map_err(|e| {
                        PipelineError::Config(format!("batched-index-size '{}': {}", value, e))
                    })?;
                }
                "near-real-time" => {}
                other => {
                    return Err(PipelineError::Config(format!(
                        "unknown queue option '{}'",
                        other
                    )))
                }
            }
        }

        let config = QueueConfig {
            name: name.ok_or_else(|| PipelineError::Config(format!("queue '{}' has no name", s)))?,
            batch_delay,
            batch_size,
        };
        config.validate()?;
        Ok(config)
    }
}

impl fmt::Display for QueueConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "name={};batch-delay={};batched-index-size={}",
            self.name,
            self.batch_delay.as_millis(),
            self.batch_size
        )
    }
}

/// Retry policy shared by all dispatchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Deliveries after the first before an entry is dead-lettered
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl DispatcherConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Backoff that never gives up; the retry ceiling bounds retries instead.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_backoff,
            initial_interval: self.initial_backoff,
            max_interval: self.max_backoff.max(self.initial_backoff),
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}
