//! Tantivy-backed document store.
//!
//! Every client stages its own adds and deletes in memory. `commit` takes
//! the index's writer, applies the staged changes and commits them while
//! holding it, so the writer never carries another client's uncommitted
//! work and `rollback` only discards this client's changes. Adds replace
//! any document with the same `id`.

use std::sync::{Arc, Mutex, MutexGuard};

use tantivy::query::{Query, QueryParser};
use tantivy::schema::Field;
use tantivy::{IndexWriter, TantivyDocument, Term};
use tracing::{debug, info, warn};

use indexer_types::IndexDocument;

use crate::document::to_tantivy_doc;
use crate::error::StoreError;
use crate::index::ContentIndex;
use crate::schema::ContentSchema;
use crate::store::DocumentStore;

enum Staged {
    Upsert { id: String, doc: TantivyDocument },
    Delete(Box<dyn Query>),
}

pub struct TantivyDocumentStore {
    name: String,
    writer: Arc<Mutex<IndexWriter>>,
    schema: ContentSchema,
    parser: QueryParser,
    staged: Vec<Staged>,
}

impl TantivyDocumentStore {
    pub fn new(index: &ContentIndex) -> Self {
        Self {
            name: "tantivy".to_string(),
            writer: index.shared_writer(),
            schema: index.schema().clone(),
            parser: index.query_parser(),
            staged: Vec::new(),
        }
    }

    /// Another client over the same index, with nothing staged.
    pub fn handle(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            writer: self.writer.clone(),
            schema: self.schema.clone(),
            parser: self.parser.clone(),
            staged: Vec::new(),
        }
    }

    pub fn staged_count(&self) -> usize {
        self.staged.len()
    }

    fn lock(&self) -> Result<MutexGuard<'_, IndexWriter>, StoreError> {
        self.writer
            .lock()
            .map_err(|e| StoreError::Backend(format!("index writer poisoned: {}", e)))
    }
}

fn apply(writer: &IndexWriter, id_field: Field, staged: Vec<Staged>) -> Result<(), StoreError> {
    for op in staged {
        match op {
            Staged::Upsert { id, doc } => {
                writer.delete_term(Term::from_field_text(id_field, &id));
                writer.add_document(doc)?;
            }
            Staged::Delete(query) => {
                writer.delete_query(query)?;
            }
        }
    }
    Ok(())
}

impl DocumentStore for TantivyDocumentStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn add(&mut self, documents: &[IndexDocument]) -> Result<(), StoreError> {
        // Convert everything first so a rejected document stages nothing.
        let mut converted = Vec::with_capacity(documents.len());
        for doc in documents {
            let tantivy_doc = to_tantivy_doc(&self.schema, doc)?;
            let id = doc.id().unwrap_or_default().to_string();
            converted.push(Staged::Upsert { id, doc: tantivy_doc });
        }
        self.staged.extend(converted);
        debug!(store = %self.name, count = documents.len(), "Staged documents");
        Ok(())
    }

    fn delete_by_query(&mut self, queries: &[String]) -> Result<(), StoreError> {
        let mut parsed = Vec::with_capacity(queries.len());
        for query in queries {
            let q = self
                .parser
                .parse_query(query)
                .map_err(|e| StoreError::InvalidQuery {
                    query: query.clone(),
                    reason: e.to_string(),
                })?;
            parsed.push(Staged::Delete(q));
        }
        self.staged.extend(parsed);
        debug!(store = %self.name, count = queries.len(), "Staged delete queries");
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let staged = std::mem::take(&mut self.staged);
        let count = staged.len();
        let id_field = self.schema.id;

        let mut writer = self.lock()?;
        let committed = apply(&writer, id_field, staged).and_then(|()| Ok(writer.commit()?));
        match committed {
            Ok(opstamp) => {
                info!(store = %self.name, opstamp, operations = count, "Committed index changes");
                Ok(())
            }
            Err(e) => {
                // Only this client's operations can be on the writer here.
                if let Err(rollback_err) = writer.rollback() {
                    warn!(store = %self.name, "Writer rollback failed: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        let discarded = self.staged.len();
        self.staged.clear();
        if discarded > 0 {
            warn!(store = %self.name, discarded, "Discarded staged index changes");
        }
        Ok(())
    }
}
