//! Content Indexer Daemon
//!
//! Drains lifecycle events through durable queues into a full-text index.
//!
//! # Usage
//!
//! ```bash
//! indexer-daemon run [--data-dir DIR] [--index-path DIR] [--queue SPEC]...
//! indexer-daemon submit --topic content/ADDED --path /docs/a [--prop key=value]...
//! indexer-daemon status
//! indexer-daemon dead-letters --queue default [--limit 20]
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded in order (later sources override earlier):
//! 1. Built-in defaults
//! 2. Config file (~/.config/content-indexer/config.toml)
//! 3. Environment variables (INDEXER_*)
//! 4. CLI flags

use anyhow::Result;
use clap::Parser;

use indexer_daemon::{run_daemon, show_dead_letters, show_status, submit_event, Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.config.as_deref();
    let log_level = cli.log_level.as_deref();

    match cli.command {
        Commands::Run { storage, queues } => {
            run_daemon(config, log_level, &storage, &queues).await?;
        }
        Commands::Submit {
            storage,
            topic,
            path,
            resource_type,
            props,
        } => {
            submit_event(
                config,
                log_level,
                &storage,
                &topic,
                &path,
                resource_type.as_deref(),
                &props,
            )?;
        }
        Commands::Status { storage } => {
            show_status(config, log_level, &storage)?;
        }
        Commands::DeadLetters {
            storage,
            queue,
            limit,
        } => {
            show_dead_letters(config, log_level, &storage, &queue, limit)?;
        }
    }

    Ok(())
}
