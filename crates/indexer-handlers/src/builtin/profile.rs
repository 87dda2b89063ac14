//! User profile sections.
//!
//! Profile data lives at `a:<user>/public/authprofile/<section>/elements/<element>`.
//! Any change at or below a section re-indexes the whole section as a single
//! document. The `basic` section is indexed with the user instead.

use tracing::debug;

use indexer_types::{id_query, IndexDocument, MutationEvent, FIELD_PATH, FIELD_RESOURCE_TYPE};

use crate::error::HandlerError;
use crate::handler::{DocumentHandler, RepositorySession};

pub const PROFILE_RESOURCE_TYPE: &str = "sakai/user-profile";

const BASIC_SECTION: &str = "basic";
const SECTION_DEPTH: usize = 4;
const ELEMENT_DEPTH: usize = 6;

/// Where in a profile tree a path points.
#[derive(Debug, PartialEq, Eq)]
struct ProfilePath {
    user: String,
    section_path: String,
    depth: usize,
}

impl ProfilePath {
    fn parse(path: &str) -> Option<Self> {
        let parts: Vec<&str> = path
            .split('/')
            .filter(|p| !p.is_empty())
            .take(ELEMENT_DEPTH)
            .collect();
        if parts.len() < SECTION_DEPTH || parts[3] == BASIC_SECTION {
            return None;
        }
        let owner = parts[0];
        let user = owner.strip_prefix("a:").unwrap_or(owner).to_string();
        let mut section_path = parts[..SECTION_DEPTH].join("/");
        if path.starts_with('/') {
            section_path.insert(0, '/');
        }
        Some(Self {
            user,
            section_path,
            depth: parts.len(),
        })
    }
}

#[derive(Debug, Default)]
pub struct ProfileSectionHandler;

impl ProfileSectionHandler {
    pub fn new() -> Self {
        Self
    }
}

impl DocumentHandler for ProfileSectionHandler {
    fn name(&self) -> &str {
        "profile-section"
    }

    fn get_documents(
        &self,
        session: &RepositorySession,
        event: &MutationEvent,
    ) -> Result<Vec<IndexDocument>, HandlerError> {
        let Some(profile) = ProfilePath::parse(event.path()) else {
            return Ok(Vec::new());
        };
        // Deleting the section itself leaves nothing to index.
        if event.is_delete() && profile.depth < ELEMENT_DEPTH {
            return Ok(Vec::new());
        }
        if session.repository.get(&profile.section_path)?.is_none() {
            debug!(section = %profile.section_path, "Profile section not found");
            return Ok(Vec::new());
        }

        let mut doc = IndexDocument::from_source(profile.section_path.clone())
            .with_id(profile.section_path.clone())
            .with_field(FIELD_PATH, profile.user.clone())
            .with_field(FIELD_PATH, profile.section_path.clone())
            .with_field("type", "u")
            .with_field(FIELD_RESOURCE_TYPE, "profile");

        let elements = format!("{}/elements", profile.section_path);
        for element in session.repository.list_children(&elements)? {
            if let Some(value) = element.property("value") {
                doc.add_field("profile", value.clone());
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
        match ProfilePath::parse(event.path()) {
            Some(profile) if profile.depth < ELEMENT_DEPTH => {
                Ok(vec![id_query(&profile.section_path)])
            }
            _ => Ok(Vec::new()),
        }
    }
}
