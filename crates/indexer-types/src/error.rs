//! Error types shared across the content indexer.

use thiserror::Error;

/// General error type for configuration and event handling.
#[derive(Debug, Error)]
pub enum IndexerError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Event failed validation at ingress
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Errors raised by the content repository and access control collaborators.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Repository could not be reached
    #[error("Repository unavailable: {0}")]
    Unavailable(String),

    /// Caller lacks permission to read the entity
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Any other backend failure
    #[error("Repository error: {0}")]
    Backend(String),
}
