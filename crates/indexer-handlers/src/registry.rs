//! Handler registry keyed by topic or resource type.
//!
//! Registrations can change while dispatchers are reading; lookups return a
//! snapshot so a handler removed mid-batch finishes its current call.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::handler::DocumentHandler;

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Vec<Arc<dyn DocumentHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `key`. Returns false if that exact handler
    /// was already registered there.
    pub fn add(&self, key: &str, handler: Arc<dyn DocumentHandler>) -> bool {
        let mut slot = self.handlers.entry(key.to_string()).or_default();
        if slot.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            return false;
        }
        debug!(key, handler = handler.name(), "Registered handler");
        slot.push(handler);
        true
    }

    /// Remove `handler` from `key`. Returns false if it was not registered.
    pub fn remove(&self, key: &str, handler: &Arc<dyn DocumentHandler>) -> bool {
        let removed = match self.handlers.get_mut(key) {
            Some(mut slot) => {
                let before = slot.len();
                slot.retain(|h| !Arc::ptr_eq(h, handler));
                before != slot.len()
            }
            None => false,
        };
        self.handlers.remove_if(key, |_, slot| slot.is_empty());
        if removed {
            debug!(key, handler = handler.name(), "Removed handler");
        }
        removed
    }

    /// Snapshot of the handlers registered under `key`.
    pub fn handlers(&self, key: &str) -> Vec<Arc<dyn DocumentHandler>> {
        self.handlers
            .get(key)
            .map(|slot| slot.clone())
            .unwrap_or_default()
    }

    pub fn has_handlers(&self, key: &str) -> bool {
        self.handlers.get(key).is_some_and(|slot| !slot.is_empty())
    }

    pub fn registration_count(&self, key: &str) -> usize {
        self.handlers.get(key).map(|slot| slot.len()).unwrap_or(0)
    }

    /// Keys with at least one handler, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .handlers
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }
}
