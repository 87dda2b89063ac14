//! The document handler contract.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, warn};

use indexer_types::{AccessControl, ContentRepository, IndexDocument, MutationEvent};

use crate::error::HandlerError;

/// Read-only view of the repository handed to every handler invocation.
#[derive(Clone)]
pub struct RepositorySession {
    pub repository: Arc<dyn ContentRepository>,
    pub access: Arc<dyn AccessControl>,
}

impl RepositorySession {
    pub fn new(repository: Arc<dyn ContentRepository>, access: Arc<dyn AccessControl>) -> Self {
        Self { repository, access }
    }

    /// Session over a single object implementing both collaborators.
    pub fn from_shared<R>(repo: Arc<R>) -> Self
    where
        R: ContentRepository + AccessControl + 'static,
    {
        Self {
            repository: repo.clone(),
            access: repo,
        }
    }
}

/// Builds search documents and delete queries for mutation events.
///
/// Handlers must not write to the repository. Errors are logged by the
/// caller and do not affect other handlers.
pub trait DocumentHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Documents to add or replace for this event.
    fn get_documents(
        &self,
        session: &RepositorySession,
        event: &MutationEvent,
    ) -> Result<Vec<IndexDocument>, HandlerError>;

    /// Delete queries for this event. Only called for `DELETE` topics.
    fn get_delete_queries(
        &self,
        session: &RepositorySession,
        event: &MutationEvent,
    ) -> Result<Vec<String>, HandlerError>;

    /// Quality-of-service capability, if the handler has one.
    fn qos(&self) -> Option<&dyn QosHandler> {
        None
    }
}

/// Optional capability: how stale a handler's documents may become.
pub trait QosHandler: Send + Sync {
    /// Longest tolerated delay before the event is indexed; `None` means
    /// no constraint.
    fn ttl(&self, event: &MutationEvent) -> Option<Duration>;
}

/// Run one handler call, turning errors and panics into `None`.
pub(crate) fn invoke_isolated<T>(
    handler: &dyn DocumentHandler,
    action: &str,
    event: &MutationEvent,
    call: impl FnOnce() -> Result<Vec<T>, HandlerError>,
) -> Option<Vec<T>> {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(items)) => Some(items),
        Ok(Err(e)) => {
            warn!(
                handler = handler.name(),
                action,
                topic = %event.topic,
                path = event.path(),
                event_id = %event.event_id,
                "Handler failed: {}",
                e
            );
            None
        }
        Err(payload) => {
            error!(
                handler = handler.name(),
                action,
                topic = %event.topic,
                path = event.path(),
                event_id = %event.event_id,
                "Handler panicked: {}",
                panic_message(payload.as_ref())
            );
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Exploding;

    impl DocumentHandler for Exploding {
        fn name(&self) -> &str {
            "exploding"
        }

        fn get_documents(
            &self,
            _session: &RepositorySession,
            _event: &MutationEvent,
        ) -> Result<Vec<IndexDocument>, HandlerError> {
            panic!("boom");
        }

        fn get_delete_queries(
            &self,
            _session: &RepositorySession,
            _event: &MutationEvent,
        ) -> Result<Vec<String>, HandlerError> {
            Err(HandlerError::Failed("no queries".to_string()))
        }
    }

    #[test]
    fn test_invoke_isolated_catches_panics_and_errors() {
        let repo = Arc::new(indexer_types::MemoryRepository::new());
        let session = RepositorySession::from_shared(repo);
        let event = MutationEvent::for_path("content/DELETE", "/a");
        let handler = Exploding;

        let docs = invoke_isolated(&handler, "get_documents", &event, || {
            handler.get_documents(&session, &event)
        });
        assert!(docs.is_none());

        let queries = invoke_isolated(&handler, "get_delete_queries", &event, || {
            handler.get_delete_queries(&session, &event)
        });
        assert!(queries.is_none());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
    }
}
