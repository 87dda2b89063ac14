//! Resource type resolution for content events.
//!
//! The router is registered under the content topics. For each event it
//! picks the handlers of the entity's resource type: the event's
//! `resourceType` if handlers exist for it, otherwise the nearest typed
//! ancestor in the repository that has handlers, otherwise the generic
//! content handler.

use std::num::NonZeroUsize;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use tracing::{debug, trace, warn};

use indexer_types::{parent_path, IndexDocument, MutationEvent, FIELD_RESOURCE_TYPE};

use crate::coordinator::CoordinatorStats;
use crate::error::HandlerError;
use crate::handler::{invoke_isolated, DocumentHandler, QosHandler, RepositorySession};
use crate::registry::HandlerRegistry;

/// Handlers chosen for one event.
struct Resolution {
    resource_type: Option<String>,
    handlers: Vec<Arc<dyn DocumentHandler>>,
}

pub struct ContentTypeRouter {
    registry: Arc<HandlerRegistry>,
    fallback: Arc<dyn DocumentHandler>,
    ignored_prefixes: Vec<String>,
    /// Paths whose own resource type has no handler
    ignore_cache: Mutex<LruCache<String, ()>>,
    stats: Arc<CoordinatorStats>,
}

impl ContentTypeRouter {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        fallback: Arc<dyn DocumentHandler>,
        ignored_prefixes: Vec<String>,
        ignore_cache_size: usize,
        stats: Arc<CoordinatorStats>,
    ) -> Self {
        let capacity = NonZeroUsize::new(ignore_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            registry,
            fallback,
            ignored_prefixes,
            ignore_cache: Mutex::new(LruCache::new(capacity)),
            stats,
        }
    }

    /// True for paths that are never indexed.
    pub fn is_ignored(&self, path: &str) -> bool {
        self.ignored_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Forget cached "no handler" verdicts, e.g. after registrations change.
    pub fn clear_ignore_cache(&self) {
        self.ignore_cache
            .lock()
            .expect("ignore cache lock poisoned")
            .clear();
    }

    pub fn ignore_cache_len(&self) -> usize {
        self.ignore_cache
            .lock()
            .expect("ignore cache lock poisoned")
            .len()
    }

    fn resolve(
        &self,
        session: &RepositorySession,
        event: &MutationEvent,
    ) -> Option<Resolution> {
        let path = event.path();
        if path.is_empty() || self.is_ignored(path) {
            debug!(path, "Path is not indexed");
            self.stats.events_ignored.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        if let Some(resource_type) = event.resource_type() {
            let handlers = self.registry.handlers(resource_type);
            if !handlers.is_empty() {
                return Some(Resolution {
                    resource_type: Some(resource_type.to_string()),
                    handlers,
                });
            }
        }

        let mut current = Some(path);
        while let Some(p) = current {
            if !self.is_cached_ignore(p) {
                match session.repository.get(p) {
                    Ok(Some(entity)) => {
                        if let Some(resource_type) = entity.resource_type() {
                            let handlers = self.registry.handlers(resource_type);
                            if !handlers.is_empty() {
                                trace!(path, typed_path = p, resource_type, "Resolved resource type");
                                return Some(Resolution {
                                    resource_type: Some(resource_type.to_string()),
                                    handlers,
                                });
                            }
                            self.cache_ignore(p);
                        }
                    }
                    Ok(None) => {}
                    // An unreadable path does not stop the walk.
                    Err(e) => warn!(path, lookup = p, "Resource type lookup failed: {}", e),
                }
            }
            current = parent_path(p);
        }

        Some(Resolution {
            resource_type: event.resource_type().map(str::to_string),
            handlers: vec![self.fallback.clone()],
        })
    }

    fn is_cached_ignore(&self, path: &str) -> bool {
        self.ignore_cache
            .lock()
            .expect("ignore cache lock poisoned")
            .get(path)
            .is_some()
    }

    fn cache_ignore(&self, path: &str) {
        self.ignore_cache
            .lock()
            .expect("ignore cache lock poisoned")
            .put(path.to_string(), ());
    }
}

impl DocumentHandler for ContentTypeRouter {
    fn name(&self) -> &str {
        "content-type-router"
    }

    fn get_documents(
        &self,
        session: &RepositorySession,
        event: &MutationEvent,
    ) -> Result<Vec<IndexDocument>, HandlerError> {
        let Some(resolution) = self.resolve(session, event) else {
            return Ok(Vec::new());
        };

        let mut documents = Vec::new();
        for handler in &resolution.handlers {
            let produced = invoke_isolated(handler.as_ref(), "get_documents", event, || {
                handler.get_documents(session, event)
            });
            match produced {
                Some(docs) => documents.extend(docs),
                None => {
                    self.stats.handler_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if let Some(resource_type) = &resolution.resource_type {
            for doc in &mut documents {
                if !doc.has_field(FIELD_RESOURCE_TYPE) {
                    doc.set_field(FIELD_RESOURCE_TYPE, resource_type.clone());
                }
            }
        }
        Ok(documents)
    }

    fn get_delete_queries(
        &self,
        session: &RepositorySession,
        event: &MutationEvent,
    ) -> Result<Vec<String>, HandlerError> {
        let Some(resolution) = self.resolve(session, event) else {
            return Ok(Vec::new());
        };

        let mut queries = Vec::new();
        for handler in &resolution.handlers {
            let produced = invoke_isolated(handler.as_ref(), "get_delete_queries", event, || {
                handler.get_delete_queries(session, event)
            });
            match produced {
                Some(q) => queries.extend(q),
                None => {
                    self.stats.handler_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(queries)
    }

    fn qos(&self) -> Option<&dyn QosHandler> {
        Some(self)
    }
}

impl QosHandler for ContentTypeRouter {
    /// Uses only the event's `resourceType`; no repository access happens
    /// on the submit path.
    fn ttl(&self, event: &MutationEvent) -> Option<Duration> {
        let resource_type = event.resource_type()?;
        self.registry
            .handlers(resource_type)
            .iter()
            .filter_map(|h| h.qos().and_then(|q| q.ttl(event)))
            .min()
    }
}
