//! The document store seam.

use indexer_types::IndexDocument;

use crate::error::StoreError;

/// Destination for indexed documents.
///
/// A store client is owned by exactly one dispatcher loop, so methods take
/// `&mut self`. Writes become visible on `commit`. Adding a document whose
/// `id` already exists replaces it.
pub trait DocumentStore: Send {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Stage documents. On `Rejected`, the caller retries one document at a
    /// time to isolate the offender.
    fn add(&mut self, documents: &[IndexDocument]) -> Result<(), StoreError>;

    /// Stage deletion of every document matching any of the queries.
    fn delete_by_query(&mut self, queries: &[String]) -> Result<(), StoreError>;

    /// Make staged writes durable and visible.
    fn commit(&mut self) -> Result<(), StoreError>;

    /// Discard staged writes.
    fn rollback(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}
