//! Error types for the indexing pipeline.

use thiserror::Error;

use indexer_search::StoreError;
use indexer_storage::StorageError;
use indexer_types::IndexerError;

/// Errors from dispatchers and the indexing service.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Dispatcher or service was started twice
    #[error("Already running")]
    AlreadyRunning,

    /// Dispatcher or service was stopped while stopped
    #[error("Not running")]
    NotRunning,

    /// Durable queue failure
    #[error("Queue error: {0}")]
    Storage(#[from] StorageError),

    /// Document store failure outside a batch, e.g. opening the index
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Event rejected at submission
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Bad queue or dispatcher configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The dispatcher task panicked; its store client is lost
    #[error("Dispatcher task failed: {0}")]
    TaskFailed(String),
}

impl From<IndexerError> for PipelineError {
    fn from(err: IndexerError) -> Self {
        match err {
            IndexerError::InvalidEvent(msg) => PipelineError::InvalidEvent(msg),
            IndexerError::Config(msg) => PipelineError::Config(msg),
            other => PipelineError::InvalidEvent(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert!(PipelineError::AlreadyRunning
            .to_string()
            .contains("Already running"));
        assert!(PipelineError::NotRunning.to_string().contains("Not running"));

        let err: PipelineError = IndexerError::InvalidEvent("no path".to_string()).into();
        assert!(matches!(err, PipelineError::InvalidEvent(_)));

        let err: PipelineError = StoreError::Unavailable("down".to_string()).into();
        assert!(err.to_string().contains("down"));
    }
}
