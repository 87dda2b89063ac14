//! CLI argument parsing for the indexer daemon.
//!
//! CLI flags override all other config sources.

use clap::{Args, Parser, Subcommand};

/// Content Indexer Daemon
///
/// Drains lifecycle events through durable queues into a full-text index.
#[derive(Parser, Debug)]
#[command(name = "indexer-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default ~/.config/content-indexer/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Storage location overrides shared by every command.
#[derive(Args, Debug, Clone, Default)]
pub struct StorageArgs {
    /// Override the queue data directory
    #[arg(long)]
    pub data_dir: Option<String>,

    /// Override the search index directory
    #[arg(long)]
    pub index_path: Option<String>,

    /// Repository snapshot (JSON) to index from
    #[arg(long)]
    pub snapshot: Option<String>,
}

/// Daemon commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the dispatchers, reading JSON-lines events from stdin
    Run {
        #[command(flatten)]
        storage: StorageArgs,

        /// Queue definition, e.g. "name=zippy;batch-delay=50;batched-index-size=100".
        /// Repeat for several queues; replaces the configured queues.
        #[arg(long = "queue", value_name = "SPEC")]
        queues: Vec<String>,
    },

    /// Durably enqueue one event without indexing it
    Submit {
        #[command(flatten)]
        storage: StorageArgs,

        /// Event topic, e.g. content/ADDED
        #[arg(short, long)]
        topic: String,

        /// Path of the changed entity
        #[arg(short, long)]
        path: String,

        /// Resource type carried by the event
        #[arg(short, long)]
        resource_type: Option<String>,

        /// Extra event property; values are parsed as JSON, else kept as text
        #[arg(long = "prop", value_name = "KEY=VALUE")]
        props: Vec<String>,
    },

    /// Show queue depth and dead-letter counts
    Status {
        #[command(flatten)]
        storage: StorageArgs,
    },

    /// List events dropped after exhausting their retries
    DeadLetters {
        #[command(flatten)]
        storage: StorageArgs,

        /// Queue name
        #[arg(short, long)]
        queue: String,

        /// Maximum entries to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}
