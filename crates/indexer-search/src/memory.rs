//! In-memory document store.
//!
//! Clones share state, so a test can keep one handle while the dispatcher
//! owns another. Delete queries support the `field:"value"` and
//! `field:value` term forms produced by the built-in handlers.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

use indexer_types::IndexDocument;

use crate::error::StoreError;
use crate::store::DocumentStore;

#[derive(Debug, Clone)]
enum StagedOp {
    Add(IndexDocument),
    Delete { field: String, value: String },
}

#[derive(Debug, Default)]
struct MemoryState {
    committed: BTreeMap<String, IndexDocument>,
    staged: Vec<StagedOp>,
    commits: u64,
    /// Applied operations in commit order, e.g. `add:/a` or `delete:id:/a`
    history: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryDocumentStore {
    name: String,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDocumentStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().expect("memory store lock poisoned")
    }

    /// Committed document by id.
    pub fn get(&self, id: &str) -> Option<IndexDocument> {
        self.state().committed.get(id).cloned()
    }

    /// Committed documents ordered by id.
    pub fn documents(&self) -> Vec<IndexDocument> {
        self.state().committed.values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.state().committed.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state().committed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn commit_count(&self) -> u64 {
        self.state().commits
    }

    pub fn staged_count(&self) -> usize {
        self.state().staged.len()
    }

    pub fn history(&self) -> Vec<String> {
        self.state().history.clone()
    }
}

/// Split `field:"value"` or `field:value` into its parts.
fn parse_term_query(query: &str) -> Option<(String, String)> {
    let (field, raw) = query.split_once(':')?;
    if field.is_empty() || field.contains(char::is_whitespace) {
        return None;
    }
    let value = if let Some(inner) = raw.strip_prefix('"') {
        let inner = inner.strip_suffix('"')?;
        let mut value = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                value.push(chars.next()?);
            } else if c == '"' {
                return None;
            } else {
                value.push(c);
            }
        }
        value
    } else {
        if raw.is_empty() || raw.contains(char::is_whitespace) {
            return None;
        }
        raw.to_string()
    };
    Some((field.to_string(), value))
}

fn field_matches(doc: &IndexDocument, field: &str, value: &str) -> bool {
    doc.get(field).iter().any(|v| match v {
        Value::String(s) => s == value,
        other => other.to_string() == value,
    })
}

impl DocumentStore for MemoryDocumentStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn add(&mut self, documents: &[IndexDocument]) -> Result<(), StoreError> {
        for doc in documents {
            if doc.id().is_none() {
                return Err(StoreError::Rejected {
                    id: String::new(),
                    reason: "document has no string id".to_string(),
                });
            }
        }
        let mut state = self.state();
        state
            .staged
            .extend(documents.iter().cloned().map(StagedOp::Add));
        Ok(())
    }

    fn delete_by_query(&mut self, queries: &[String]) -> Result<(), StoreError> {
        let mut parsed = Vec::with_capacity(queries.len());
        for query in queries {
            let (field, value) =
                parse_term_query(query).ok_or_else(|| StoreError::InvalidQuery {
                    query: query.clone(),
                    reason: "expected field:\"value\"".to_string(),
                })?;
            parsed.push(StagedOp::Delete { field, value });
        }
        self.state().staged.extend(parsed);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        let mut state = self.state();
        let staged = std::mem::take(&mut state.staged);
        for op in staged {
            match op {
                StagedOp::Add(doc) => {
                    let id = doc.id().unwrap_or_default().to_string();
                    state.history.push(format!("add:{}", id));
                    state.committed.insert(id, doc);
                }
                StagedOp::Delete { field, value } => {
                    state.history.push(format!("delete:{}:{}", field, value));
                    state
                        .committed
                        .retain(|_, doc| !field_matches(doc, &field, &value));
                }
            }
        }
        state.commits += 1;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.state().staged.clear();
        Ok(())
    }
}
