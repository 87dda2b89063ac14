//! # indexer-handlers
//!
//! Turns mutation events into search documents.
//!
//! - [`DocumentHandler`]: pluggable builder of documents and delete queries
//! - [`HandlerRegistry`]: topic or resource type to handlers, mutable at runtime
//! - [`ContentTypeRouter`]: resolves the resource type of content events
//! - [`IndexingCoordinator`]: invokes handlers in isolation, fills in system
//!   fields, drops documents without content
//! - [`builtin`]: authorizable, profile section, tag and generic content handlers

pub mod builtin;
pub mod coordinator;
pub mod error;
pub mod handler;
pub mod registry;
pub mod router;

pub use builtin::{register_builtin_handlers, BuiltinHandlers};
pub use coordinator::{
    CoordinatorConfig, CoordinatorStats, CoordinatorStatsSnapshot, IndexingCoordinator,
};
pub use error::HandlerError;
pub use handler::{DocumentHandler, QosHandler, RepositorySession};
pub use registry::HandlerRegistry;
pub use router::ContentTypeRouter;
