//! Lifecycle events emitted by the content repository.
//!
//! Topics have the form `<kind>/<PHASE>`, for example `content/ADDED` or
//! `authorizables/DELETE`. Every event carries a `path` property; the
//! `resourceType` and `ttl` properties are optional.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::error::IndexerError;

/// Topic kind for content items.
pub const KIND_CONTENT: &str = "content";

/// Topic kind for users and groups.
pub const KIND_AUTHORIZABLES: &str = "authorizables";

/// Mandatory event property naming the affected entity.
pub const PROP_PATH: &str = "path";

/// Optional event property naming the entity's type.
pub const PROP_RESOURCE_TYPE: &str = "resourceType";

/// Optional event property: tolerated indexing delay in milliseconds.
pub const PROP_TTL: &str = "ttl";

/// Lifecycle phase encoded in the topic suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Added,
    Updated,
    Deleted,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Added, Phase::Updated, Phase::Deleted];

    /// Topic suffix for this phase.
    pub fn suffix(&self) -> &'static str {
        match self {
            Phase::Added => "ADDED",
            Phase::Updated => "UPDATED",
            Phase::Deleted => "DELETE",
        }
    }

    /// Parse the phase from the last segment of a topic.
    pub fn from_topic(topic: &str) -> Option<Self> {
        match topic.rsplit('/').next()? {
            "ADDED" => Some(Phase::Added),
            "UPDATED" => Some(Phase::Updated),
            "DELETE" => Some(Phase::Deleted),
            _ => None,
        }
    }

    /// Build the full topic for a kind, e.g. `content/DELETE`.
    pub fn topic(&self, kind: &str) -> String {
        format!("{}/{}", kind, self.suffix())
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.suffix())
    }
}

/// Topics the content router listens on when none are configured.
pub fn default_content_topics() -> Vec<String> {
    Phase::ALL.iter().map(|p| p.topic(KIND_CONTENT)).collect()
}

/// An immutable notification that an entity changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationEvent {
    /// Assigned at ingress, used to correlate log lines.
    pub event_id: Ulid,
    pub topic: String,
    pub properties: BTreeMap<String, Value>,
}

impl MutationEvent {
    /// Create an event, rejecting property maps without a non-empty `path`.
    pub fn new(
        topic: impl Into<String>,
        properties: BTreeMap<String, Value>,
    ) -> Result<Self, IndexerError> {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(IndexerError::InvalidEvent("topic is empty".to_string()));
        }
        match properties.get(PROP_PATH) {
            Some(Value::String(p)) if !p.is_empty() => {}
            _ => {
                return Err(IndexerError::InvalidEvent(format!(
                    "event on {} has no path",
                    topic
                )))
            }
        }
        Ok(Self {
            event_id: Ulid::new(),
            topic,
            properties,
        })
    }

    /// Convenience constructor for an event about a single path.
    pub fn for_path(topic: impl Into<String>, path: impl Into<String>) -> Self {
        let mut properties = BTreeMap::new();
        properties.insert(PROP_PATH.to_string(), Value::String(path.into()));
        Self {
            event_id: Ulid::new(),
            topic: topic.into(),
            properties,
        }
    }

    /// Builder-style property setter.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Builder-style resource type setter.
    pub fn with_resource_type(self, resource_type: impl Into<String>) -> Self {
        self.with_property(PROP_RESOURCE_TYPE, resource_type.into())
    }

    /// Path of the affected entity. Empty only for events that bypassed `new`.
    pub fn path(&self) -> &str {
        self.property_str(PROP_PATH).unwrap_or("")
    }

    pub fn resource_type(&self) -> Option<&str> {
        self.property_str(PROP_RESOURCE_TYPE).filter(|t| !t.is_empty())
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    pub fn phase(&self) -> Option<Phase> {
        Phase::from_topic(&self.topic)
    }

    pub fn is_delete(&self) -> bool {
        self.phase() == Some(Phase::Deleted)
    }

    /// Topic without the phase suffix (`content/ADDED` -> `content`).
    pub fn kind(&self) -> &str {
        match self.topic.rfind('/') {
            Some(idx) => &self.topic[..idx],
            None => &self.topic,
        }
    }

    /// Producer-supplied staleness tolerance, from a number or numeric string.
    pub fn ttl(&self) -> Option<Duration> {
        let millis = match self.properties.get(PROP_TTL)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        }?;
        Some(Duration::from_millis(millis))
    }
}

/// The set of topics a listener registers for.
///
/// Empty input always falls back to [`default_content_topics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicList(Vec<String>);

impl TopicList {
    /// Parse a `|`-delimited topic string such as `content/ADDED|content/DELETE`.
    pub fn parse(raw: &str) -> Self {
        Self::from_topics(raw.split('|'))
    }

    pub fn from_topics<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let topics: Vec<String> = topics
            .into_iter()
            .map(|t| t.as_ref().trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if topics.is_empty() {
            Self::default()
        } else {
            Self(topics)
        }
    }

    pub fn topics(&self) -> &[String] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<String> {
        self.0
    }
}

impl Default for TopicList {
    fn default() -> Self {
        Self(default_content_topics())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_phase_from_topic() {
        assert_eq!(Phase::from_topic("content/ADDED"), Some(Phase::Added));
        assert_eq!(Phase::from_topic("authorizables/DELETE"), Some(Phase::Deleted));
        assert_eq!(Phase::from_topic("content/MOVED"), None);
        assert_eq!(Phase::Updated.topic(KIND_CONTENT), "content/UPDATED");
    }

    #[test]
    fn test_new_requires_path() {
        let err = MutationEvent::new("content/ADDED", BTreeMap::new()).unwrap_err();
        assert!(matches!(err, IndexerError::InvalidEvent(_)));

        let mut props = BTreeMap::new();
        props.insert(PROP_PATH.to_string(), json!(""));
        assert!(MutationEvent::new("content/ADDED", props).is_err());

        let mut props = BTreeMap::new();
        props.insert(PROP_PATH.to_string(), json!("/a/b"));
        let event = MutationEvent::new("content/ADDED", props).unwrap();
        assert_eq!(event.path(), "/a/b");
        assert_eq!(event.kind(), "content");
        assert!(!event.is_delete());
    }

    #[test]
    fn test_ttl_accepts_numbers_and_strings() {
        let event = MutationEvent::for_path("content/ADDED", "x").with_property(PROP_TTL, 30);
        assert_eq!(event.ttl(), Some(Duration::from_millis(30)));

        let event = MutationEvent::for_path("content/ADDED", "x").with_property(PROP_TTL, "5000");
        assert_eq!(event.ttl(), Some(Duration::from_millis(5000)));

        let event = MutationEvent::for_path("content/ADDED", "x").with_property(PROP_TTL, "soon");
        assert_eq!(event.ttl(), None);
    }

    #[test]
    fn test_empty_resource_type_is_none() {
        let event = MutationEvent::for_path("content/ADDED", "x").with_resource_type("");
        assert_eq!(event.resource_type(), None);
    }

    #[test]
    fn test_topic_list_parse() {
        let list = TopicList::parse("content/ADDED|content/DELETE");
        assert_eq!(list.topics(), &["content/ADDED", "content/DELETE"]);

        assert_eq!(TopicList::parse(""), TopicList::default());
        assert_eq!(TopicList::from_topics(Vec::<String>::new()), TopicList::default());
        assert_eq!(TopicList::default().topics().len(), 3);
    }
}
