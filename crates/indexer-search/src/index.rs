//! The on-disk content index.
//!
//! Tantivy allows one writer per index, so the index owns it and every
//! [`TantivyDocumentStore`](crate::TantivyDocumentStore) client borrows it
//! for the length of a commit. Reads go through a single reader that is
//! reloaded before each count.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tantivy::collector::Count;
use tantivy::directory::MmapDirectory;
use tantivy::query::QueryParser;
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy};
use tracing::info;

use crate::error::StoreError;
use crate::schema::{build_content_schema, ContentSchema};

const DEFAULT_WRITER_MEMORY_MB: usize = 50;

#[derive(Debug, Clone)]
pub struct SearchIndexConfig {
    pub index_path: PathBuf,
    /// Indexing memory of the shared writer, split across its threads
    pub writer_memory_mb: usize,
}

impl SearchIndexConfig {
    pub fn new(index_path: impl Into<PathBuf>) -> Self {
        Self {
            index_path: index_path.into(),
            writer_memory_mb: DEFAULT_WRITER_MEMORY_MB,
        }
    }

    pub fn with_memory_mb(mut self, mb: usize) -> Self {
        self.writer_memory_mb = mb;
        self
    }
}

pub struct ContentIndex {
    index: Index,
    schema: ContentSchema,
    writer: Arc<Mutex<IndexWriter>>,
    reader: IndexReader,
    path: PathBuf,
}

impl ContentIndex {
    /// Open the index at `config.index_path`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Fails if the directory holds an index with a different schema or
    /// another process already holds its writer lock.
    pub fn open_or_create(config: SearchIndexConfig) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&config.index_path)?;
        let directory = MmapDirectory::open(&config.index_path)
            .map_err(|e| StoreError::Backend(format!("cannot open index directory: {}", e)))?;
        let index = Index::open_or_create(directory, build_content_schema().schema().clone())?;
        let schema = ContentSchema::from_schema(index.schema())?;

        let writer = index.writer(config.writer_memory_mb * 1024 * 1024)?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;

        info!(
            path = ?config.index_path,
            writer_memory_mb = config.writer_memory_mb,
            docs = reader.searcher().num_docs(),
            "Opened content index"
        );
        Ok(Self {
            index,
            schema,
            writer: Arc::new(Mutex::new(writer)),
            reader,
            path: config.index_path,
        })
    }

    pub fn schema(&self) -> &ContentSchema {
        &self.schema
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn shared_writer(&self) -> Arc<Mutex<IndexWriter>> {
        self.writer.clone()
    }

    /// Query parser over the system fields, `id` being the default field.
    pub fn query_parser(&self) -> QueryParser {
        QueryParser::for_index(
            &self.index,
            vec![
                self.schema.id,
                self.schema.path,
                self.schema.resource_type,
                self.schema.readers,
            ],
        )
    }

    /// Number of committed documents matching `query`.
    pub fn count(&self, query: &str) -> Result<usize, StoreError> {
        let parsed = self
            .query_parser()
            .parse_query(query)
            .map_err(|e| StoreError::InvalidQuery {
                query: query.to_string(),
                reason: e.to_string(),
            })?;
        self.reader.reload()?;
        Ok(self.reader.searcher().search(&parsed, &Count)?)
    }

    /// Number of committed documents.
    pub fn num_docs(&self) -> Result<u64, StoreError> {
        self.reader.reload()?;
        Ok(self.reader.searcher().num_docs())
    }
}
