//! Indexer daemon library exports.
//!
//! # Modules
//!
//! - `cli`: Command-line argument parsing with clap
//! - `commands`: Command implementations (run, submit, status, dead-letters)

pub mod cli;
pub mod commands;

pub use cli::{Cli, Commands, StorageArgs};
pub use commands::{run_daemon, show_dead_letters, show_status, submit_event};
