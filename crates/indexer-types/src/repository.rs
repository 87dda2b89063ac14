//! Read-only collaborators consulted while building documents.
//!
//! The indexer never writes to the repository. [`MemoryRepository`] backs the
//! daemon (loaded from a JSON snapshot) and the tests.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{IndexerError, RepositoryError};
use crate::event::PROP_RESOURCE_TYPE;
use crate::path::{ancestors, parent_path};

/// A content item addressed by path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub path: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

impl Entity {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_resource_type(self, resource_type: impl Into<String>) -> Self {
        self.with_property(PROP_RESOURCE_TYPE, resource_type.into())
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
}

/// A user or group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Authorizable {
    pub id: String,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    /// Groups this authorizable belongs to.
    #[serde(default)]
    pub principals: Vec<String>,
    /// Direct members, for groups.
    #[serde(default)]
    pub members: Vec<String>,
}

impl Authorizable {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_group: false,
            properties: BTreeMap::new(),
            principals: Vec::new(),
            members: Vec::new(),
        }
    }

    pub fn group(id: impl Into<String>) -> Self {
        Self {
            is_group: true,
            ..Self::user(id)
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principals.push(principal.into());
        self
    }

    pub fn with_member(mut self, member: impl Into<String>) -> Self {
        self.members.push(member.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    pub fn has_property(&self, key: &str) -> bool {
        self.properties.contains_key(key)
    }
}

/// Access control zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Zone {
    Content,
    Authorizables,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Delete,
}

/// Grant of a permission on a path to a principal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AclGrant {
    pub zone: Zone,
    pub path: String,
    pub principal: String,
    #[serde(default = "default_permission")]
    pub permission: Permission,
}

fn default_permission() -> Permission {
    Permission::Read
}

/// Read access to content and authorizables.
pub trait ContentRepository: Send + Sync {
    fn get(&self, path: &str) -> Result<Option<Entity>, RepositoryError>;

    fn list_children(&self, path: &str) -> Result<Vec<Entity>, RepositoryError>;

    fn find_authorizable(&self, id: &str) -> Result<Option<Authorizable>, RepositoryError>;
}

/// Principal lookup for reader computation.
pub trait AccessControl: Send + Sync {
    /// Principals holding `permission` on `path`. With `include_inherited`,
    /// grants on ancestors count too.
    fn find_principals(
        &self,
        zone: Zone,
        path: &str,
        permission: Permission,
        include_inherited: bool,
    ) -> Result<Vec<String>, RepositoryError>;
}

/// Serialized form of a [`MemoryRepository`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositorySnapshot {
    #[serde(default)]
    pub content: Vec<Entity>,
    #[serde(default)]
    pub authorizables: Vec<Authorizable>,
    #[serde(default)]
    pub grants: Vec<AclGrant>,
}

/// In-memory repository and access control.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    entities: RwLock<BTreeMap<String, Entity>>,
    authorizables: RwLock<BTreeMap<String, Authorizable>>,
    grants: RwLock<Vec<AclGrant>>,
    offline: AtomicBool,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: RepositorySnapshot) -> Self {
        let repo = Self::new();
        for entity in snapshot.content {
            repo.put_entity(entity);
        }
        for authorizable in snapshot.authorizables {
            repo.put_authorizable(authorizable);
        }
        for grant in snapshot.grants {
            repo.grants.write().expect("grants lock poisoned").push(grant);
        }
        repo
    }

    /// Load a JSON snapshot file.
    pub fn load(path: &Path) -> Result<Self, IndexerError> {
        let bytes = std::fs::read(path)
            .map_err(|e| IndexerError::Config(format!("{}: {}", path.display(), e)))?;
        let snapshot: RepositorySnapshot = serde_json::from_slice(&bytes)?;
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn put_entity(&self, entity: Entity) {
        self.entities
            .write()
            .expect("entities lock poisoned")
            .insert(entity.path.clone(), entity);
    }

    pub fn remove_entity(&self, path: &str) -> Option<Entity> {
        self.entities
            .write()
            .expect("entities lock poisoned")
            .remove(path)
    }

    pub fn put_authorizable(&self, authorizable: Authorizable) {
        self.authorizables
            .write()
            .expect("authorizables lock poisoned")
            .insert(authorizable.id.clone(), authorizable);
    }

    pub fn remove_authorizable(&self, id: &str) -> Option<Authorizable> {
        self.authorizables
            .write()
            .expect("authorizables lock poisoned")
            .remove(id)
    }

    pub fn grant(
        &self,
        zone: Zone,
        path: impl Into<String>,
        principal: impl Into<String>,
        permission: Permission,
    ) {
        self.grants.write().expect("grants lock poisoned").push(AclGrant {
            zone,
            path: path.into(),
            principal: principal.into(),
            permission,
        });
    }

    /// Make every call fail with `Unavailable` until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), RepositoryError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable(
                "memory repository is offline".to_string(),
            ));
        }
        Ok(())
    }
}

impl ContentRepository for MemoryRepository {
    fn get(&self, path: &str) -> Result<Option<Entity>, RepositoryError> {
        self.check_online()?;
        Ok(self
            .entities
            .read()
            .expect("entities lock poisoned")
            .get(path)
            .cloned())
    }

    fn list_children(&self, path: &str) -> Result<Vec<Entity>, RepositoryError> {
        self.check_online()?;
        let entities = self.entities.read().expect("entities lock poisoned");
        Ok(entities
            .values()
            .filter(|e| parent_path(&e.path) == Some(path))
            .cloned()
            .collect())
    }

    fn find_authorizable(&self, id: &str) -> Result<Option<Authorizable>, RepositoryError> {
        self.check_online()?;
        Ok(self
            .authorizables
            .read()
            .expect("authorizables lock poisoned")
            .get(id)
            .cloned())
    }
}

impl AccessControl for MemoryRepository {
    fn find_principals(
        &self,
        zone: Zone,
        path: &str,
        permission: Permission,
        include_inherited: bool,
    ) -> Result<Vec<String>, RepositoryError> {
        self.check_online()?;
        let paths = if include_inherited {
            ancestors(path)
        } else {
            vec![path.to_string()]
        };
        let grants = self.grants.read().expect("grants lock poisoned");
        let mut principals: Vec<String> = Vec::new();
        for p in &paths {
            for grant in grants.iter() {
                if grant.zone == zone
                    && grant.permission == permission
                    && &grant.path == p
                    && !principals.contains(&grant.principal)
                {
                    principals.push(grant.principal.clone());
                }
            }
        }
        Ok(principals)
    }
}
