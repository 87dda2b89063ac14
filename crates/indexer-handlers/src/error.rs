//! Handler error types.

use indexer_types::RepositoryError;
use thiserror::Error;

/// Errors a document handler may return.
///
/// The coordinator logs these per handler; they never fail the batch.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Repository or access-control lookup failed
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// Event lacks a property the handler needs
    #[error("Event {topic} is missing property {property}")]
    MissingProperty { topic: String, property: String },

    /// Any other handler failure
    #[error("Handler failed: {0}")]
    Failed(String),
}
