//! Column family definitions for a queue database.
//!
//! - pending: entries awaiting delivery or acknowledgement
//! - dead_letter: entries removed after exhausting their retries

use rocksdb::{ColumnFamilyDescriptor, Options};

/// Column family for entries not yet acknowledged
pub const CF_PENDING: &str = "pending";

/// Column family for entries dropped at the retry ceiling
pub const CF_DEAD_LETTER: &str = "dead_letter";

/// All column family names
pub const ALL_CF_NAMES: &[&str] = &[CF_PENDING, CF_DEAD_LETTER];

fn pending_options() -> Options {
    let mut opts = Options::default();
    // Entries are short-lived; keep compaction cheap.
    opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
    opts
}

fn dead_letter_options() -> Options {
    let mut opts = Options::default();
    opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
    opts
}

/// Build all column family descriptors
pub fn build_cf_descriptors() -> Vec<ColumnFamilyDescriptor> {
    vec![
        ColumnFamilyDescriptor::new(CF_PENDING, pending_options()),
        ColumnFamilyDescriptor::new(CF_DEAD_LETTER, dead_letter_options()),
    ]
}
