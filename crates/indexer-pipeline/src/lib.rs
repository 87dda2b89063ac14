//! # indexer-pipeline
//!
//! Moves accepted events from durable queues into the document store.
//!
//! - [`QueueDispatcher`]: one task per queue; batch, commit, ack, retry
//! - [`IndexingService`]: owns the queues, routes submissions by TTL
//! - [`QueueConfig`] / [`DispatcherConfig`]: pacing and retry policy

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod service;
pub mod stats;

#[cfg(test)]
mod testing;

pub use config::{DispatcherConfig, QueueConfig};
pub use dispatcher::{DispatcherState, QueueDispatcher};
pub use error::PipelineError;
pub use service::{IndexingService, QueueBacklog, QueueReport, ServiceStats};
pub use stats::{DispatcherStats, DispatcherStatsSnapshot};
