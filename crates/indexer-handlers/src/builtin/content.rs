//! Fallback handler for content without a more specific handler.
//!
//! Copies every property of the entity into the document, except internal
//! (`_`-prefixed) properties and properties named like a system field.

use tracing::trace;

use indexer_types::{id_query, IndexDocument, MutationEvent, SYSTEM_FIELDS};

use crate::error::HandlerError;
use crate::handler::{DocumentHandler, RepositorySession};

#[derive(Debug, Default)]
pub struct ContentHandler;

impl ContentHandler {
    pub fn new() -> Self {
        Self
    }
}

fn is_indexable(property: &str) -> bool {
    !property.starts_with('_') && !SYSTEM_FIELDS.contains(&property)
}

impl DocumentHandler for ContentHandler {
    fn name(&self) -> &str {
        "content"
    }

    fn get_documents(
        &self,
        session: &RepositorySession,
        event: &MutationEvent,
    ) -> Result<Vec<IndexDocument>, HandlerError> {
        let path = event.path();
        let Some(entity) = session.repository.get(path)? else {
            trace!(path, "No entity to index");
            return Ok(Vec::new());
        };
        let mut doc = IndexDocument::from_source(path);
        for (property, value) in &entity.properties {
            if is_indexable(property) {
                doc.add_field(property.clone(), value.clone());
            }
        }
        Ok(vec![doc])
    }

    fn get_delete_queries(
        &self,
        _session: &RepositorySession,
        event: &MutationEvent,
    ) -> Result<Vec<String>, HandlerError> {
        if !event.is_delete() {
            return Ok(Vec::new());
        }
        Ok(vec![id_query(event.path())])
    }
}
