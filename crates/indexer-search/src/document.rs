//! Conversion from [`IndexDocument`] to Tantivy documents.

use serde_json::{Map, Value};
use tantivy::TantivyDocument;

use indexer_types::{IndexDocument, SYSTEM_FIELDS};

use crate::error::StoreError;
use crate::schema::{ContentSchema, FIELD_CONTENT};

/// Build the Tantivy document for `doc`.
///
/// Fails with `Rejected` when the document has no string id or a system
/// field holds values the schema cannot take.
pub fn to_tantivy_doc(schema: &ContentSchema, doc: &IndexDocument) -> Result<TantivyDocument, StoreError> {
    let id = doc.id().ok_or_else(|| StoreError::Rejected {
        id: doc
            .first(indexer_types::FIELD_ID)
            .map(|v| v.to_string())
            .unwrap_or_default(),
        reason: "document has no string id".to_string(),
    })?;

    let mut object = Map::new();
    let mut content = Map::new();
    for (name, values) in &doc.fields {
        if values.is_empty() {
            continue;
        }
        if SYSTEM_FIELDS.contains(&name.as_str()) {
            object.insert(name.clone(), Value::Array(values.clone()));
        } else {
            content.insert(name.clone(), Value::Array(values.clone()));
        }
    }
    object.insert(FIELD_CONTENT.to_string(), Value::Object(content));

    let json = Value::Object(object).to_string();
    TantivyDocument::parse_json(schema.schema(), &json).map_err(|e| StoreError::Rejected {
        id: id.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::build_content_schema;
    use serde_json::json;

    #[test]
    fn test_document_without_id_is_rejected() {
        let schema = build_content_schema();
        let doc = IndexDocument::new().with_field("title", "x");
        assert!(matches!(
            to_tantivy_doc(&schema, &doc),
            Err(StoreError::Rejected { .. })
        ));
    }

    #[test]
    fn test_non_string_path_is_rejected() {
        let schema = build_content_schema();
        let doc = IndexDocument::new()
            .with_id("/a")
            .with_field("path", json!({"nested": true}))
            .with_field("title", "x");
        let err = to_tantivy_doc(&schema, &doc).unwrap_err();
        assert!(matches!(err, StoreError::Rejected { ref id, .. } if id == "/a"));
    }

    #[test]
    fn test_valid_document_converts() {
        let schema = build_content_schema();
        let doc = IndexDocument::new()
            .with_id("/a")
            .with_field("path", json!(["/a", "/"]))
            .with_field("readers", "everyone")
            .with_field("title", "hello")
            .with_field("count", 3);
        assert!(to_tantivy_doc(&schema, &doc).is_ok());
    }
}
