//! Tag entities.

use tracing::debug;

use indexer_types::{id_query, IndexDocument, MutationEvent};

use crate::error::HandlerError;
use crate::handler::{DocumentHandler, RepositorySession};

pub const TAG_RESOURCE_TYPE: &str = "sakai/tag";

const PROP_TAG_NAME: &str = "sakai:tag-name";

#[derive(Debug, Default)]
pub struct TagHandler;

impl TagHandler {
    pub fn new() -> Self {
        Self
    }
}

impl DocumentHandler for TagHandler {
    fn name(&self) -> &str {
        "tag"
    }

    fn get_documents(
        &self,
        session: &RepositorySession,
        event: &MutationEvent,
    ) -> Result<Vec<IndexDocument>, HandlerError> {
        let path = event.path();
        let Some(entity) = session.repository.get(path)? else {
            debug!(path, "Tag not found");
            return Ok(Vec::new());
        };
        let tag_name = entity
            .property(PROP_TAG_NAME)
            .ok_or_else(|| HandlerError::MissingProperty {
                topic: event.topic.clone(),
                property: PROP_TAG_NAME.to_string(),
            })?;
        Ok(vec![
            IndexDocument::from_source(path).with_field("tagname", tag_name.clone())
        ])
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

#[cfg(test)]
mod tests {
    use super::*;
    use indexer_types::{Entity, MemoryRepository};
    use std::sync::Arc;

    #[test]
    fn test_tag_document_and_delete() {
        let repo = Arc::new(MemoryRepository::new());
        repo.put_entity(
            Entity::new("/tags/rust")
                .with_resource_type(TAG_RESOURCE_TYPE)
                .with_property("sakai:tag-name", "rust"),
        );
        let session = RepositorySession::from_shared(repo);
        let handler = TagHandler::new();

        let added = MutationEvent::for_path("content/ADDED", "/tags/rust");
        let docs = handler.get_documents(&session, &added).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].first_str("tagname"), Some("rust"));
        assert!(handler.get_delete_queries(&session, &added).unwrap().is_empty());

        let deleted = MutationEvent::for_path("content/DELETE", "/tags/rust");
        assert_eq!(
            handler.get_delete_queries(&session, &deleted).unwrap(),
            vec![r#"id:"/tags/rust""#]
        );
    }

    #[test]
    fn test_tag_without_name_is_an_error() {
        let repo = Arc::new(MemoryRepository::new());
        repo.put_entity(Entity::new("/tags/x").with_resource_type(TAG_RESOURCE_TYPE));
        let session = RepositorySession::from_shared(repo);

        let event = MutationEvent::for_path("content/UPDATED", "/tags/x");
        assert!(matches!(
            TagHandler::new().get_documents(&session, &event),
            Err(HandlerError::MissingProperty { .. })
        ));
    }
}
