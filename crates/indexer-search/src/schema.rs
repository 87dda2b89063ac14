//! Tantivy schema for indexed content.
//!
//! System fields get their own columns so they can be filtered exactly;
//! every handler-defined field lands in the `fields` JSON object.

use tantivy::schema::{Field, Schema, STORED, STRING, TEXT};

use indexer_types::{FIELD_ID, FIELD_PATH, FIELD_READERS, FIELD_RESOURCE_TYPE};

use crate::error::StoreError;

/// Name of the JSON field holding handler-defined fields.
pub const FIELD_CONTENT: &str = "fields";

/// Schema field handles
#[derive(Debug, Clone)]
pub struct ContentSchema {
    schema: Schema,
    /// Primary key (STRING | STORED)
    pub id: Field,
    /// Entity path and its ancestors (STRING | STORED)
    pub path: Field,
    /// Resource type (STRING | STORED)
    pub resource_type: Field,
    /// Principals allowed to read (STRING | STORED)
    pub readers: Field,
    /// Handler-defined fields (JSON, TEXT | STORED)
    pub content: Field,
}

impl ContentSchema {
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Create a ContentSchema from an existing Tantivy Schema
    pub fn from_schema(schema: Schema) -> Result<Self, StoreError> {
        let get = |name: &str| {
            schema
                .get_field(name)
                .map_err(|_| StoreError::Backend(format!("schema missing {} field", name)))
        };
        let id = get(FIELD_ID)?;
        let path = get(FIELD_PATH)?;
        let resource_type = get(FIELD_RESOURCE_TYPE)?;
        let readers = get(FIELD_READERS)?;
        let content = get(FIELD_CONTENT)?;

        Ok(Self {
            schema,
            id,
            path,
            resource_type,
            readers,
            content,
        })
    }
}

pub fn build_content_schema() -> ContentSchema {
    let mut schema_builder = Schema::builder();

    let id = schema_builder.add_text_field(FIELD_ID, STRING | STORED);
    let path = schema_builder.add_text_field(FIELD_PATH, STRING | STORED);
    let resource_type = schema_builder.add_text_field(FIELD_RESOURCE_TYPE, STRING | STORED);
    let readers = schema_builder.add_text_field(FIELD_READERS, STRING | STORED);
    let content = schema_builder.add_json_field(FIELD_CONTENT, TEXT | STORED);

    ContentSchema {
        schema: schema_builder.build(),
        id,
        path,
        resource_type,
        readers,
        content,
    }
}
