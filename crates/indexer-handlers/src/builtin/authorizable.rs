//! Users and groups.
//!
//! Registered directly on the `authorizables/*` topics. Each user-facing
//! authorizable becomes one document keyed by its id, carrying a whitelisted
//! subset of its properties plus group membership and readers.

use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::{debug, error};

use indexer_types::{
    id_query, Authorizable, IndexDocument, MutationEvent, Permission, Phase, Zone, FIELD_ID,
    FIELD_PATH, FIELD_READERS, FIELD_RESOURCE_TYPE,
};

use crate::error::HandlerError;
use crate::handler::{DocumentHandler, RepositorySession};

/// Ids that are never indexed.
pub const IGNORED_AUTHORIZABLES: &[&str] = &["everyone", "anonymous", "admin", "owner", "system"];

const RESOURCE_TYPE: &str = "authorizable";
const CONTACTS_GROUP_PREFIX: &str = "g-contacts-";

const PROP_FIRST_NAME: &str = "firstName";
const PROP_LAST_NAME: &str = "lastName";
const PROP_GROUP_TITLE: &str = "sakai:group-title";
const PROP_CATEGORY: &str = "sakai:category";
const PROP_PSEUDO_GROUP: &str = "sakai:pseudoGroup";
const PROP_EXCLUDE_SEARCH: &str = "sakai:excludeSearch";
const PROP_MANAGED_GROUP: &str = "sakai:managed-group";
const PROP_PARENT_GROUP: &str = "sakai:parent-group-id";

/// Property name to document field, users.
const USER_FIELDS: &[(&str, &str)] = &[
    ("name", "name"),
    (PROP_FIRST_NAME, "firstName"),
    (PROP_LAST_NAME, "lastName"),
    ("email", "email"),
    ("type", "type"),
    ("sakai:tags", "tag"),
    ("lastModified", "lastModified"),
    ("countLastUpdate", "countLastUpdate"),
];

/// Property name to document field, groups.
const GROUP_FIELDS: &[(&str, &str)] = &[
    ("name", "name"),
    ("type", "type"),
    (PROP_GROUP_TITLE, "title"),
    ("sakai:group-description", "description"),
    ("sakai:tags", "tag"),
    (PROP_CATEGORY, "category"),
    ("lastModified", "lastModified"),
    ("countLastUpdate", "countLastUpdate"),
    ("rep:group-managers", "manager"),
    (PROP_EXCLUDE_SEARCH, "exclude"),
];

const NGRAM_PROPS: &[&str] = &[PROP_FIRST_NAME, PROP_LAST_NAME, PROP_GROUP_TITLE];

/// Adds fields to an authorizable document after the handler built it.
pub trait AuthorizableDecorator: Send + Sync {
    fn name(&self) -> &str;

    fn decorate(
        &self,
        session: &RepositorySession,
        event: &MutationEvent,
        authorizable: &Authorizable,
        doc: &mut IndexDocument,
    ) -> Result<(), HandlerError>;
}

pub struct AuthorizableHandler {
    basic_profile_elements: Vec<String>,
    decorators: RwLock<Vec<Arc<dyn AuthorizableDecorator>>>,
}

impl AuthorizableHandler {
    pub fn new(basic_profile_elements: Vec<String>) -> Self {
        Self {
            basic_profile_elements,
            decorators: RwLock::new(Vec::new()),
        }
    }

    pub fn add_decorator(&self, decorator: Arc<dyn AuthorizableDecorator>) {
        self.decorators
            .write()
            .expect("decorators lock poisoned")
            .push(decorator);
    }

    pub fn remove_decorator(&self, decorator: &Arc<dyn AuthorizableDecorator>) -> bool {
        let mut decorators = self.decorators.write().expect("decorators lock poisoned");
        let before = decorators.len();
        decorators.retain(|d| !Arc::ptr_eq(d, decorator));
        before != decorators.len()
    }

    fn build_document(
        &self,
        session: &RepositorySession,
        authorizable: &Authorizable,
    ) -> Result<Option<IndexDocument>, HandlerError> {
        let id = authorizable.id.as_str();
        if IGNORED_AUTHORIZABLES.contains(&id)
            || !is_user_facing(authorizable)
            || authorizable.has_property(PROP_MANAGED_GROUP)
        {
            debug!(id, "Authorizable is not indexed");
            return Ok(None);
        }

        let mut doc = IndexDocument::from_source(id);
        let whitelist = if authorizable.is_group {
            GROUP_FIELDS
        } else {
            USER_FIELDS
        };
        for (property, value) in &authorizable.properties {
            if let Some((_, field)) = whitelist.iter().find(|(p, _)| p == property) {
                doc.add_field(*field, value.clone());
            }
            if NGRAM_PROPS.contains(&property.as_str()) {
                doc.add_field("ngram", value.clone());
                doc.add_field("edgengram", value.clone());
            }
        }

        if authorizable.is_group {
            for member in &authorizable.members {
                doc.add_field(FIELD_READERS, member.clone());
            }
            set_optional(&mut doc, "general_sort", authorizable.property(PROP_GROUP_TITLE));
        } else {
            for element in &self.basic_profile_elements {
                if let Some(value) = authorizable.property(element) {
                    doc.add_field("profile", value.clone());
                }
            }
            set_optional(&mut doc, "general_sort", authorizable.property(PROP_LAST_NAME));
        }

        for principal in &authorizable.principals {
            let Some(group) = session.repository.find_authorizable(principal)? else {
                continue;
            };
            if group.is_group {
                if let Some(parent) = group.property(PROP_PARENT_GROUP) {
                    doc.add_field("group", parent.clone());
                }
            }
            doc.add_field("group", principal.clone());
        }

        // Members are readers too, so the coordinator does not fill this in.
        let readers = session
            .access
            .find_principals(Zone::Authorizables, id, Permission::Read, true)?;
        for reader in readers {
            doc.add_field(FIELD_READERS, reader);
        }

        doc.set_field(FIELD_PATH, id);
        doc.set_field("returnpath", id);
        doc.set_field(FIELD_RESOURCE_TYPE, RESOURCE_TYPE);
        doc.set_field(FIELD_ID, id);
        Ok(Some(doc))
    }
}

impl DocumentHandler for AuthorizableHandler {
    fn name(&self) -> &str {
        "authorizable"
    }

    fn get_documents(
        &self,
        session: &RepositorySession,
        event: &MutationEvent,
    ) -> Result<Vec<IndexDocument>, HandlerError> {
        if !matches!(event.phase(), Some(Phase::Added) | Some(Phase::Updated)) {
            return Ok(Vec::new());
        }
        let id = event.path();
        let Some(authorizable) = session.repository.find_authorizable(id)? else {
            debug!(id, "Authorizable not found");
            return Ok(Vec::new());
        };
        let Some(mut doc) = self.build_document(session, &authorizable)? else {
            return Ok(Vec::new());
        };

        let decorators = self
            .decorators
            .read()
            .expect("decorators lock poisoned")
            .clone();
        for decorator in decorators {
            if let Err(e) = decorator.decorate(session, event, &authorizable, &mut doc) {
                error!(
                    decorator = decorator.name(),
                    id,
                    "Decorator failed, indexing undecorated fields: {}",
                    e
                );
            }
        }
        Ok(vec![doc])
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

fn set_optional(doc: &mut IndexDocument, field: &str, value: Option<&Value>) {
    if let Some(value) = value {
        doc.set_field(field, value.clone());
    }
}

/// `true` for a boolean `true` or the string `"true"`.
fn flag(authorizable: &Authorizable, property: &str) -> bool {
    match authorizable.property(property) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// Users always; groups only when they are meant to be found.
fn is_user_facing(authorizable: &Authorizable) -> bool {
    if !authorizable.is_group {
        return true;
    }
    if authorizable.id.starts_with(CONTACTS_GROUP_PREFIX) {
        return false;
    }
    let top_level_collection = authorizable.property_str(PROP_CATEGORY) == Some("collection")
        && !flag(authorizable, PROP_PSEUDO_GROUP);
    if !top_level_collection && flag(authorizable, PROP_EXCLUDE_SEARCH) {
        return false;
    }
    authorizable
        .property_str(PROP_GROUP_TITLE)
        .is_some_and(|title| !title.is_empty())
}
