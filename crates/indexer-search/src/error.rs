//! Document store error types.

use thiserror::Error;

/// Errors returned by a [`crate::DocumentStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// Store cannot be reached or is busy; the whole batch should be retried
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store will never accept this document
    #[error("Document rejected ({id}): {reason}")]
    Rejected { id: String, reason: String },

    /// The store cannot parse this delete query
    #[error("Invalid delete query '{query}': {reason}")]
    InvalidQuery { query: String, reason: String },

    /// Any other backend failure
    #[error("Store error: {0}")]
    Backend(String),
}

impl StoreError {
    /// True for failures that may succeed when retried unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<tantivy::TantivyError> for StoreError {
    fn from(err: tantivy::TantivyError) -> Self {
        use tantivy::TantivyError;
        match err {
            TantivyError::LockFailure(..)
            | TantivyError::IoError(_)
            | TantivyError::ErrorInThread(_) => StoreError::Unavailable(err.to_string()),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}
