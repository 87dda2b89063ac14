//! Built-in document handlers.

mod authorizable;
mod content;
mod profile;
mod tag;

use std::sync::Arc;

use tracing::info;

use indexer_types::{Phase, Settings, TopicList, KIND_AUTHORIZABLES};

use crate::coordinator::IndexingCoordinator;
use crate::handler::DocumentHandler;

pub use authorizable::{AuthorizableDecorator, AuthorizableHandler, IGNORED_AUTHORIZABLES};
pub use content::ContentHandler;
pub use profile::{ProfileSectionHandler, PROFILE_RESOURCE_TYPE};
pub use tag::{TagHandler, TAG_RESOURCE_TYPE};

/// Handlers registered by [`register_builtin_handlers`], kept so callers can
/// attach decorators or unregister them later.
pub struct BuiltinHandlers {
    pub authorizable: Arc<AuthorizableHandler>,
    pub profile: Arc<ProfileSectionHandler>,
    pub tag: Arc<TagHandler>,
}

/// Register every built-in handler and activate content routing on the
/// configured topics.
pub fn register_builtin_handlers(
    coordinator: &IndexingCoordinator,
    settings: &Settings,
) -> BuiltinHandlers {
    let authorizable = Arc::new(AuthorizableHandler::new(
        settings.basic_profile_elements.clone(),
    ));
    for phase in Phase::ALL {
        let handler: Arc<dyn DocumentHandler> = authorizable.clone();
        coordinator.add_handler(&phase.topic(KIND_AUTHORIZABLES), handler);
    }

    let profile = Arc::new(ProfileSectionHandler::new());
    coordinator.add_handler(PROFILE_RESOURCE_TYPE, profile.clone());

    let tag = Arc::new(TagHandler::new());
    coordinator.add_handler(TAG_RESOURCE_TYPE, tag.clone());

    coordinator.activate(TopicList::from_topics(&settings.content_topics));
    info!(
        topics = ?coordinator.active_topics(),
        "Registered built-in handlers"
    );

    BuiltinHandlers {
        authorizable,
        profile,
        tag,
    }
}
