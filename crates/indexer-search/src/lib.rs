//! # indexer-search
//!
//! Destination of the indexing pipeline.
//!
//! - [`DocumentStore`]: add / delete-by-query / commit, owned by one dispatcher
//! - [`TantivyDocumentStore`]: embedded full-text index, idempotent by `id`
//! - [`MemoryDocumentStore`]: in-process store for tests and dry runs
//!
//! Errors are classified so the dispatcher can tell transient outages
//! (retry the batch) from documents the store will never accept (drop them).

pub mod document;
pub mod error;
pub mod index;
pub mod memory;
pub mod schema;
pub mod store;
pub mod tantivy_store;

pub use error::StoreError;
pub use index::{ContentIndex, SearchIndexConfig};
pub use memory::MemoryDocumentStore;
pub use schema::{build_content_schema, ContentSchema};
pub use store::DocumentStore;
pub use tantivy_store::TantivyDocumentStore;
