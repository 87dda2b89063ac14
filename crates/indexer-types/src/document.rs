//! Documents handed to the document store.
//!
//! A document is a map of field name to one or more JSON values. The four
//! system fields are filled in by the coordinator when a handler leaves them
//! unset; a document carrying nothing but system fields is never stored.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const FIELD_ID: &str = "id";
pub const FIELD_PATH: &str = "path";
pub const FIELD_RESOURCE_TYPE: &str = "resourceType";
pub const FIELD_READERS: &str = "readers";

/// Fields that do not count as indexable content.
pub const SYSTEM_FIELDS: &[&str] = &[FIELD_ID, FIELD_PATH, FIELD_RESOURCE_TYPE, FIELD_READERS];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub fields: BTreeMap<String, Vec<Value>>,

    /// Repository path the document was built from.
    #[serde(skip)]
    pub source_path: Option<String>,

    /// Omit the `readers` field instead of computing it.
    #[serde(skip)]
    pub suppress_readers: bool,
}

impl IndexDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Document built from the entity at `path`.
    pub fn from_source(path: impl Into<String>) -> Self {
        Self {
            source_path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.set_field(FIELD_ID, id.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.add_field(name, value);
        self
    }

    pub fn without_readers(mut self) -> Self {
        self.suppress_readers = true;
        self
    }

    /// Append a value. Arrays are flattened, nulls are skipped.
    pub fn add_field(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        match value.into() {
            Value::Null => {}
            Value::Array(values) => {
                let slot = self.fields.entry(name).or_default();
                slot.extend(values.into_iter().filter(|v| !v.is_null()));
            }
            other => self.fields.entry(name).or_default().push(other),
        }
    }

    /// Replace all values of a field.
    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        self.fields.remove(&name);
        self.add_field(name, value);
    }

    pub fn remove_field(&mut self, name: &str) -> Option<Vec<Value>> {
        self.fields.remove(name)
    }

    pub fn get(&self, name: &str) -> &[Value] {
        self.fields.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn first(&self, name: &str) -> Option<&Value> {
        self.get(name).first()
    }

    pub fn first_str(&self, name: &str) -> Option<&str> {
        self.first(name).and_then(Value::as_str)
    }

    /// String values of a field; non-string values are rendered as JSON.
    pub fn strings(&self, name: &str) -> Vec<String> {
        self.get(name)
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect()
    }

    /// True when the field exists with at least one value.
    pub fn has_field(&self, name: &str) -> bool {
        !self.get(name).is_empty()
    }

    pub fn id(&self) -> Option<&str> {
        self.first_str(FIELD_ID)
    }

    /// True when at least one non-system field carries a value.
    pub fn has_content_fields(&self) -> bool {
        self.fields
            .iter()
            .any(|(name, values)| !values.is_empty() && !SYSTEM_FIELDS.contains(&name.as_str()))
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}
