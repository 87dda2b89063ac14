//! Indexing coordinator.
//!
//! Given one event, the coordinator:
//! 1. invokes every handler registered for the event's topic, each in
//!    isolation (content topics reach type handlers through the router)
//! 2. fills in unset system fields: `id`, `path` (with ancestors),
//!    `resourceType` and `readers`
//! 3. drops documents that carry nothing but system fields
//!
//! Delete queries are only requested for `DELETE` topics. The coordinator is
//! shared by all dispatchers and holds no per-batch state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use indexer_types::{
    ancestors, IndexDocument, MutationEvent, Permission, Settings, TopicList, Zone, FIELD_ID,
    FIELD_PATH, FIELD_READERS, FIELD_RESOURCE_TYPE, KIND_AUTHORIZABLES,
};

use crate::builtin::ContentHandler;
use crate::handler::{invoke_isolated, DocumentHandler, RepositorySession};
use crate::registry::HandlerRegistry;
use crate::router::ContentTypeRouter;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub ignored_path_prefixes: Vec<String>,
    pub ignore_cache_size: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        let settings = Settings::default();
        Self::from_settings(&settings)
    }
}

impl CoordinatorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            ignored_path_prefixes: settings.ignored_path_prefixes.clone(),
            ignore_cache_size: settings.ignore_cache_size,
        }
    }

    pub fn with_ignored_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.ignored_path_prefixes = prefixes;
        self
    }

    pub fn with_ignore_cache_size(mut self, size: usize) -> Self {
        self.ignore_cache_size = size;
        self
    }
}

/// Counters shared by the coordinator and router.
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    pub documents_built: AtomicU64,
    pub documents_filtered: AtomicU64,
    pub handler_failures: AtomicU64,
    pub events_ignored: AtomicU64,
    pub reader_lookup_failures: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorStatsSnapshot {
    pub documents_built: u64,
    pub documents_filtered: u64,
    pub handler_failures: u64,
    pub events_ignored: u64,
    pub reader_lookup_failures: u64,
}

impl CoordinatorStats {
    pub fn snapshot(&self) -> CoordinatorStatsSnapshot {
        CoordinatorStatsSnapshot {
            documents_built: self.documents_built.load(Ordering::Relaxed),
            documents_filtered: self.documents_filtered.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            events_ignored: self.events_ignored.load(Ordering::Relaxed),
            reader_lookup_failures: self.reader_lookup_failures.load(Ordering::Relaxed),
        }
    }
}

pub struct IndexingCoordinator {
    registry: Arc<HandlerRegistry>,
    router: Arc<ContentTypeRouter>,
    session: RepositorySession,
    active_topics: Mutex<Vec<String>>,
    stats: Arc<CoordinatorStats>,
}

impl IndexingCoordinator {
    pub fn new(session: RepositorySession, config: CoordinatorConfig) -> Self {
        let registry = Arc::new(HandlerRegistry::new());
        let stats = Arc::new(CoordinatorStats::default());
        let router = Arc::new(ContentTypeRouter::new(
            registry.clone(),
            Arc::new(ContentHandler::new()),
            config.ignored_path_prefixes,
            config.ignore_cache_size,
            stats.clone(),
        ));
        Self {
            registry,
            router,
            session,
            active_topics: Mutex::new(Vec::new()),
            stats,
        }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<ContentTypeRouter> {
        &self.router
    }

    pub fn session(&self) -> &RepositorySession {
        &self.session
    }

    pub fn stats(&self) -> CoordinatorStatsSnapshot {
        self.stats.snapshot()
    }

    /// Register a handler for a topic or resource type.
    pub fn add_handler(&self, key: &str, handler: Arc<dyn DocumentHandler>) -> bool {
        let added = self.registry.add(key, handler);
        self.router.clear_ignore_cache();
        added
    }

    pub fn remove_handler(&self, key: &str, handler: &Arc<dyn DocumentHandler>) -> bool {
        let removed = self.registry.remove(key, handler);
        self.router.clear_ignore_cache();
        removed
    }

    /// Register the content router on `topics`, replacing any previous
    /// activation. An empty list means the default content topics.
    pub fn activate(&self, topics: TopicList) {
        self.deactivate();
        let router: Arc<dyn DocumentHandler> = self.router.clone();
        let topics = topics.into_inner();
        for topic in &topics {
            self.registry.add(topic, router.clone());
        }
        info!(topics = ?topics, "Content indexing activated");
        *self.active_topics.lock().expect("topics lock poisoned") = topics;
    }

    /// Remove every registration made by `activate`. Returns how many
    /// topics were deactivated.
    pub fn deactivate(&self) -> usize {
        let router: Arc<dyn DocumentHandler> = self.router.clone();
        let topics = std::mem::take(&mut *self.active_topics.lock().expect("topics lock poisoned"));
        for topic in &topics {
            self.registry.remove(topic, &router);
        }
        if !topics.is_empty() {
            info!(topics = ?topics, "Content indexing deactivated");
        }
        topics.len()
    }

    pub fn active_topics(&self) -> Vec<String> {
        self.active_topics
            .lock()
            .expect("topics lock poisoned")
            .clone()
    }

    /// Documents to add for `event`, enriched and filtered.
    pub fn get_documents(&self, event: &MutationEvent) -> Vec<IndexDocument> {
        let handlers = self.registry.handlers(&event.topic);
        if handlers.is_empty() {
            debug!(topic = %event.topic, "No handlers for topic");
            return Vec::new();
        }

        let mut documents = Vec::new();
        for handler in &handlers {
            let produced = invoke_isolated(handler.as_ref(), "get_documents", event, || {
                handler.get_documents(&self.session, event)
            });
            match produced {
                Some(docs) => documents.extend(docs),
                None => {
                    self.stats.handler_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let zone = zone_for(event);
        let mut kept = Vec::with_capacity(documents.len());
        for mut doc in documents {
            self.enrich(event, zone, &mut doc);
            if doc.has_content_fields() {
                kept.push(doc);
            } else {
                debug!(
                    id = doc.id().unwrap_or_default(),
                    event_id = %event.event_id,
                    "Dropping document without content fields"
                );
                self.stats.documents_filtered.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.stats
            .documents_built
            .fetch_add(kept.len() as u64, Ordering::Relaxed);
        kept
    }

    /// Delete queries for `event`; empty unless the topic is a DELETE.
    pub fn get_delete_queries(&self, event: &MutationEvent) -> Vec<String> {
        if !event.is_delete() {
            return Vec::new();
        }
        let mut queries = Vec::new();
        for handler in self.registry.handlers(&event.topic) {
            let produced = invoke_isolated(handler.as_ref(), "get_delete_queries", event, || {
                handler.get_delete_queries(&self.session, event)
            });
            match produced {
                Some(q) => queries.extend(q),
                None => {
                    self.stats.handler_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        queries
    }

    /// Smallest TTL any handler of this event asks for; `None` is unbounded.
    pub fn get_ttl(&self, event: &MutationEvent) -> Option<Duration> {
        self.registry
            .handlers(&event.topic)
            .iter()
            .filter_map(|h| h.qos().and_then(|q| q.ttl(event)))
            .min()
    }

    fn enrich(&self, event: &MutationEvent, zone: Zone, doc: &mut IndexDocument) {
        let source = doc
            .source_path
            .clone()
            .unwrap_or_else(|| event.path().to_string());

        if !doc.has_field(FIELD_ID) {
            doc.set_field(FIELD_ID, source.clone());
        }
        if !doc.has_field(FIELD_PATH) {
            for path in ancestors(&source) {
                doc.add_field(FIELD_PATH, path);
            }
        }
        if !doc.has_field(FIELD_RESOURCE_TYPE) {
            if let Some(resource_type) = event.resource_type() {
                doc.set_field(FIELD_RESOURCE_TYPE, resource_type.to_string());
            }
        }

        if doc.suppress_readers {
            doc.remove_field(FIELD_READERS);
        } else if !doc.has_field(FIELD_READERS) {
            match self
                .session
                .access
                .find_principals(zone, &source, Permission::Read, true)
            {
                Ok(principals) => {
                    for principal in principals {
                        doc.add_field(FIELD_READERS, principal);
                    }
                }
                Err(e) => {
                    self.stats
                        .reader_lookup_failures
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(
                        path = %source,
                        event_id = %event.event_id,
                        "Reader lookup failed, indexing without readers: {}",
                        e
                    );
                }
            }
        }
    }
}

fn zone_for(event: &MutationEvent) -> Zone {
    if event.kind() == KIND_AUTHORIZABLES {
        Zone::Authorizables
    } else {
        Zone::Content
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::handler::QosHandler;
    use indexer_types::{default_content_topics, Entity, MemoryRepository};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    /// Handler returning fixed documents and queries.
    struct Fixed {
        name: &'static str,
        docs: Vec<IndexDocument>,
        queries: Vec<String>,
        ttl: Option<Duration>,
    }

    impl Fixed {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                docs: Vec::new(),
                queries: Vec::new(),
                ttl: None,
            }
        }

        fn doc(mut self, doc: IndexDocument) -> Self {
            self.docs.push(doc);
            self
        }

        fn query(mut self, q: &str) -> Self {
            self.queries.push(q.to_string());
            self
        }

        fn ttl(mut self, ms: u64) -> Self {
            self.ttl = Some(Duration::from_millis(ms));
            self
        }
    }

    impl DocumentHandler for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn get_documents(
            &self,
            _session: &RepositorySession,
            _event: &MutationEvent,
        ) -> Result<Vec<IndexDocument>, HandlerError> {
            Ok(self.docs.clone())
        }

        fn get_delete_queries(
            &self,
            _session: &RepositorySession,
            _event: &MutationEvent,
        ) -> Result<Vec<String>, HandlerError> {
            Ok(self.queries.clone())
        }

        fn qos(&self) -> Option<&dyn QosHandler> {
            self.ttl.map(|_| self as &dyn QosHandler)
        }
    }

    impl QosHandler for Fixed {
        fn ttl(&self, _event: &MutationEvent) -> Option<Duration> {
            self.ttl
        }
    }

    struct Failing;

    impl DocumentHandler for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn get_documents(
            &self,
            _session: &RepositorySession,
            _event: &MutationEvent,
        ) -> Result<Vec<IndexDocument>, HandlerError> {
            Err(HandlerError::Failed("cannot build".to_string()))
        }

        fn get_delete_queries(
            &self,
            _session: &RepositorySession,
            _event: &MutationEvent,
        ) -> Result<Vec<String>, HandlerError> {
            panic!("delete query panic");
        }
    }

    fn coordinator() -> (IndexingCoordinator, Arc<MemoryRepository>) {
        let repo = Arc::new(MemoryRepository::new());
        let coordinator = IndexingCoordinator::new(
            RepositorySession::from_shared(repo.clone()),
            CoordinatorConfig::default(),
        );
        (coordinator, repo)
    }

    fn content_doc(title: &str) -> IndexDocument {
        IndexDocument::new().with_field("title", title)
    }

    #[test]
    fn test_enrichment_fills_system_fields() {
        let (coordinator, repo) = coordinator();
        repo.grant(Zone::Content, "/a", "everyone", Permission::Read);
        repo.grant(Zone::Content, "/a/b", "alice", Permission::Read);
        coordinator.add_handler("content/ADDED", Arc::new(Fixed::new("f").doc(content_doc("x"))));

        let event = MutationEvent::for_path("content/ADDED", "/a/b").with_resource_type("sakai/x");
        let docs = coordinator.get_documents(&event);

        assert_eq!(docs.len(), 1);
        let doc = &docs[0];
        assert_eq!(doc.id(), Some("/a/b"));
        assert_eq!(doc.strings(FIELD_PATH), vec!["/a/b", "/a", "/"]);
        assert_eq!(doc.first_str(FIELD_RESOURCE_TYPE), Some("sakai/x"));
        assert_eq!(doc.strings(FIELD_READERS), vec!["alice", "everyone"]);
    }

    #[test]
    fn test_enrichment_keeps_handler_values() {
        let (coordinator, repo) = coordinator();
        repo.grant(Zone::Content, "/a", "everyone", Permission::Read);
        let doc = content_doc("x")
            .with_id("custom")
            .with_field(FIELD_PATH, "elsewhere")
            .with_field(FIELD_READERS, "bob");
        coordinator.add_handler("content/ADDED", Arc::new(Fixed::new("f").doc(doc)));

        let docs = coordinator.get_documents(&MutationEvent::for_path("content/ADDED", "/a"));
        assert_eq!(docs[0].id(), Some("custom"));
        assert_eq!(docs[0].strings(FIELD_PATH), vec!["elsewhere"]);
        assert_eq!(docs[0].strings(FIELD_READERS), vec!["bob"]);
    }

    #[test]
    fn test_suppressed_readers_are_removed() {
        let (coordinator, repo) = coordinator();
        repo.grant(Zone::Content, "/a", "everyone", Permission::Read);
        let doc = content_doc("x")
            .with_field(FIELD_READERS, "bob")
            .without_readers();
        coordinator.add_handler("content/ADDED", Arc::new(Fixed::new("f").doc(doc)));

        let docs = coordinator.get_documents(&MutationEvent::for_path("content/ADDED", "/a"));
        assert!(!docs[0].has_field(FIELD_READERS));
    }

    #[test]
    fn test_reader_lookup_failure_still_emits_document() {
        let (coordinator, repo) = coordinator();
        coordinator.add_handler("content/ADDED", Arc::new(Fixed::new("f").doc(content_doc("x"))));
        repo.set_offline(true);

        let docs = coordinator.get_documents(&MutationEvent::for_path("content/ADDED", "/a"));
        assert_eq!(docs.len(), 1);
        assert!(!docs[0].has_field(FIELD_READERS));
        assert_eq!(coordinator.stats().reader_lookup_failures, 1);
    }

    #[test]
    fn test_authorizable_topics_use_authorizable_zone() {
        let (coordinator, repo) = coordinator();
        repo.grant(Zone::Content, "alice", "wrong-zone", Permission::Read);
        repo.grant(Zone::Authorizables, "alice", "everyone", Permission::Read);
        coordinator.add_handler(
            "authorizables/UPDATED",
            Arc::new(Fixed::new("f").doc(content_doc("x"))),
        );

        let docs =
            coordinator.get_documents(&MutationEvent::for_path("authorizables/UPDATED", "alice"));
        assert_eq!(docs[0].strings(FIELD_READERS), vec!["everyone"]);
    }

    #[test]
    fn test_system_only_documents_are_dropped() {
        let (coordinator, _repo) = coordinator();
        let empty = IndexDocument::new()
            .with_id("/a")
            .with_field(FIELD_PATH, "/a")
            .with_field(FIELD_RESOURCE_TYPE, "t");
        coordinator.add_handler(
            "content/ADDED",
            Arc::new(Fixed::new("f").doc(empty).doc(content_doc("kept"))),
        );

        let docs = coordinator.get_documents(&MutationEvent::for_path("content/ADDED", "/a"));
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].first_str("title"), Some("kept"));
        assert_eq!(coordinator.stats().documents_filtered, 1);
    }

    #[test]
    fn test_failing_handler_does_not_affect_others() {
        let (coordinator, _repo) = coordinator();
        coordinator.add_handler("content/DELETE", Arc::new(Failing));
        coordinator.add_handler(
            "content/DELETE",
            Arc::new(Fixed::new("ok").doc(content_doc("x")).query("id:\"/a\"")),
        );

        let event = MutationEvent::for_path("content/DELETE", "/a");
        assert_eq!(coordinator.get_documents(&event).len(), 1);
        assert_eq!(coordinator.get_delete_queries(&event), vec!["id:\"/a\""]);
        assert_eq!(coordinator.stats().handler_failures, 2);
    }

    #[test]
    fn test_delete_queries_only_for_delete_topics() {
        let (coordinator, _repo) = coordinator();
        let handler: Arc<dyn DocumentHandler> = Arc::new(Fixed::new("f").query("id:\"/a\""));
        coordinator.add_handler("content/UPDATED", handler.clone());
        coordinator.add_handler("content/DELETE", handler);

        assert!(coordinator
            .get_delete_queries(&MutationEvent::for_path("content/UPDATED", "/a"))
            .is_empty());
        assert_eq!(
            coordinator.get_delete_queries(&MutationEvent::for_path("content/DELETE", "/a")),
            vec!["id:\"/a\""]
        );
    }

    #[test]
    fn test_ttl_is_minimum_over_qos_handlers() {
        let (coordinator, _repo) = coordinator();
        let event = MutationEvent::for_path("content/ADDED", "/a");
        assert_eq!(coordinator.get_ttl(&event), None);

        coordinator.add_handler("content/ADDED", Arc::new(Fixed::new("plain")));
        coordinator.add_handler("content/ADDED", Arc::new(Fixed::new("slow").ttl(500)));
        coordinator.add_handler("content/ADDED", Arc::new(Fixed::new("fast").ttl(30)));
        assert_eq!(coordinator.get_ttl(&event), Some(Duration::from_millis(30)));
    }

    #[test]
    fn test_type_resolution_walks_to_typed_ancestor() {
        let (coordinator, repo) = coordinator();
        repo.put_entity(Entity::new("parent").with_resource_type("testType"));
        repo.put_entity(Entity::new("parent/child"));
        coordinator.activate(TopicList::default());
        coordinator.add_handler(
            "testType",
            Arc::new(Fixed::new("typed").doc(content_doc("from testType"))),
        );

        let docs =
            coordinator.get_documents(&MutationEvent::for_path("content/UPDATED", "parent/child"));
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].first_str("title"), Some("from testType"));
        assert_eq!(docs[0].first_str(FIELD_RESOURCE_TYPE), Some("testType"));
    }

    #[test]
    fn test_event_resource_type_wins_over_repository() {
        let (coordinator, repo) = coordinator();
        repo.put_entity(Entity::new("/x").with_resource_type("other"));
        coordinator.activate(TopicList::default());
        coordinator.add_handler("other", Arc::new(Fixed::new("other").doc(content_doc("other"))));
        coordinator.add_handler("mine", Arc::new(Fixed::new("mine").doc(content_doc("mine"))));

        let event = MutationEvent::for_path("content/ADDED", "/x").with_resource_type("mine");
        let docs = coordinator.get_documents(&event);
        assert_eq!(docs[0].first_str("title"), Some("mine"));
    }

    #[test]
    fn test_untyped_content_falls_back_to_generic_handler() {
        let (coordinator, repo) = coordinator();
        repo.put_entity(Entity::new("/notes/n1").with_property("title", "hello"));
        coordinator.activate(TopicList::default());

        let docs = coordinator.get_documents(&MutationEvent::for_path("content/ADDED", "/notes/n1"));
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].first_str("title"), Some("hello"));
        assert_eq!(docs[0].id(), Some("/notes/n1"));
    }

    #[test]
    fn test_delete_with_repository_offline_uses_generic_handler() {
        let (coordinator, repo) = coordinator();
        repo.put_entity(Entity::new("/docs").with_resource_type("folder"));
        coordinator.add_handler("folder", Arc::new(Fixed::new("folder").query("folder:x")));
        coordinator.activate(TopicList::default());
        repo.set_offline(true);

        let event = MutationEvent::for_path("content/DELETE", "/docs/x");
        assert_eq!(
            coordinator.get_delete_queries(&event),
            vec![r#"id:"/docs/x""#.to_string()]
        );
        assert_eq!(coordinator.stats().handler_failures, 0);
    }

    #[test]
    fn test_ignored_prefixes_produce_nothing() {
        let (coordinator, repo) = coordinator();
        repo.put_entity(Entity::new("/var/cache/x").with_property("title", "hello"));
        coordinator.activate(TopicList::default());

        let event = MutationEvent::for_path("content/ADDED", "/var/cache/x");
        assert!(coordinator.get_documents(&event).is_empty());
        assert_eq!(coordinator.stats().events_ignored, 1);
    }

    #[test]
    fn test_unhandled_type_is_cached_and_cache_clears_on_registration() {
        let (coordinator, repo) = coordinator();
        repo.put_entity(Entity::new("/t").with_resource_type("late").with_property("title", "t"));
        coordinator.activate(TopicList::default());

        let event = MutationEvent::for_path("content/ADDED", "/t");
        coordinator.get_documents(&event);
        assert_eq!(coordinator.router().ignore_cache_len(), 1);

        coordinator.add_handler("late", Arc::new(Fixed::new("late").doc(content_doc("late"))));
        assert_eq!(coordinator.router().ignore_cache_len(), 0);
        let docs = coordinator.get_documents(&event);
        assert_eq!(docs[0].first_str("title"), Some("late"));
    }

    #[test]
    fn test_deactivate_and_reactivate() {
        let (coordinator, _repo) = coordinator();
        coordinator.activate(TopicList::parse("content/ADDED|content/DELETE"));
        assert_eq!(coordinator.registry().registration_count("content/ADDED"), 1);
        assert!(!coordinator.registry().has_handlers("content/UPDATED"));

        assert_eq!(coordinator.deactivate(), 2);
        assert_eq!(coordinator.registry().registration_count("content/ADDED"), 0);
        assert_eq!(coordinator.registry().registration_count("content/DELETE"), 0);
        assert!(coordinator.registry().keys().is_empty());

        coordinator.activate(TopicList::from_topics(Vec::<String>::new()));
        assert_eq!(coordinator.active_topics(), default_content_topics());
        for topic in default_content_topics() {
            assert_eq!(coordinator.registry().registration_count(&topic), 1);
        }
    }

    #[test]
    fn test_router_ttl_uses_event_resource_type() {
        let (coordinator, _repo) = coordinator();
        coordinator.activate(TopicList::default());
        coordinator.add_handler("fast", Arc::new(Fixed::new("fast").ttl(30)));

        let typed = MutationEvent::for_path("content/ADDED", "/a").with_resource_type("fast");
        assert_eq!(coordinator.get_ttl(&typed), Some(Duration::from_millis(30)));
        let untyped = MutationEvent::for_path("content/ADDED", "/a");
        assert_eq!(coordinator.get_ttl(&untyped), None);
    }

    #[test]
    fn test_documents_carry_json_values() {
        let (coordinator, _repo) = coordinator();
        let doc = IndexDocument::new().with_field("count", json!(3));
        coordinator.add_handler("content/ADDED", Arc::new(Fixed::new("f").doc(doc)));
        let docs = coordinator.get_documents(&MutationEvent::for_path("content/ADDED", "/a"));
        assert_eq!(docs[0].first("count"), Some(&json!(3)));
    }
}
