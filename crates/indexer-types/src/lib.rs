//! # indexer-types
//!
//! Shared domain types for the content indexer.
//!
//! - Events: immutable lifecycle notifications (`content/ADDED`, ...)
//! - Documents: field maps handed to the document store
//! - Queue entries: durable wrappers around events
//! - Repository: read-only collaborator traits plus an in-memory implementation
//! - Settings: layered configuration

pub mod config;
pub mod document;
pub mod error;
pub mod event;
pub mod path;
pub mod query;
pub mod queue;
pub mod repository;

pub use config::{QueueSettings, Settings};
pub use document::{
    IndexDocument, FIELD_ID, FIELD_PATH, FIELD_READERS, FIELD_RESOURCE_TYPE, SYSTEM_FIELDS,
};
pub use error::{IndexerError, RepositoryError};
pub use event::{
    default_content_topics, MutationEvent, Phase, TopicList, KIND_AUTHORIZABLES, KIND_CONTENT,
    PROP_PATH, PROP_RESOURCE_TYPE, PROP_TTL,
};
pub use path::{ancestors, parent_path};
pub use query::{id_query, quote_term, term_query};
pub use queue::QueueEntry;
pub use repository::{
    AccessControl, AclGrant, Authorizable, ContentRepository, Entity, MemoryRepository,
    Permission, RepositorySnapshot, Zone,
};
