use crate::{
    clock::Clock,
    resource::{Meta, Resource, ResourceKey, ResourceType, Spec},
};
use parking_lot::RwLock;
use std::{collections::BTreeMap, sync::Arc};

/// Reads resources from the backing store.
#[async_trait::async_trait]
pub trait ResourceStore: Send + Sync + 'static {
    async fn get(&self, rtype: ResourceType, key: &ResourceKey) -> Result<Resource, StoreError>;

    /// Lists resources of a type ordered by key. When `mesh` is set, only resources in that
    /// mesh are returned.
    async fn list(
        &self,
        rtype: ResourceType,
        mesh: Option<&str>,
    ) -> Result<Vec<Resource>, StoreError>;
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{rtype} {key} not found")]
    NotFound { rtype: ResourceType, key: ResourceKey },

    #[error("{rtype} {key} already exists")]
    AlreadyExists { rtype: ResourceType, key: ResourceKey },

    #[error("{rtype} {key} has been modified: expected version {expected}, found {actual}")]
    Conflict {
        rtype: ResourceType,
        key: ResourceKey,
        expected: String,
        actual: String,
    },

    #[error("invalid {rtype} key {key:?}: {reason}")]
    InvalidKey {
        rtype: ResourceType,
        key: ResourceKey,
        reason: &'static str,
    },

    #[error("resource store unavailable: {0}")]
    Unavailable(String),
}

/// An in-memory store with versioned writes.
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    state: RwLock<State>,
}

#[derive(Default)]
struct State {
    next_version: u64,
    resources: BTreeMap<ResourceType, BTreeMap<ResourceKey, Resource>>,
}

// === impl StoreError ===

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    fn not_found(rtype: ResourceType, key: &ResourceKey) -> Self {
        Self::NotFound {
            rtype,
            key: key.clone(),
        }
    }
}

// === impl MemoryStore ===

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Default::default(),
        }
    }

    pub fn create(
        &self,
        mesh: &str,
        name: &str,
        spec: impl Into<Spec>,
    ) -> Result<Meta, StoreError> {
        let spec = spec.into();
        let rtype = spec.resource_type();
        let key = ResourceKey::new(mesh, name);
        validate_key(rtype, &key)?;

        let mut state = self.state.write();
        if state.get(rtype, &key).is_some() {
            return Err(StoreError::AlreadyExists { rtype, key });
        }
        let now = self.clock.now();
        let meta = Meta {
            mesh: key.mesh.clone(),
            name: key.name.clone(),
            version: state.next_version(),
            creation_time: now,
            modification_time: now,
        };
        tracing::debug!(%rtype, %key, version = %meta.version, "Created");
        state
            .resources
            .entry(rtype)
            .or_default()
            .insert(key, Resource {
                meta: meta.clone(),
                spec,
            });
        Ok(meta)
    }

    /// Replaces the spec of an existing resource if it is still at `version`.
    pub fn update(
        &self,
        key: &ResourceKey,
        spec: impl Into<Spec>,
        version: &str,
    ) -> Result<Meta, StoreError> {
        let spec = spec.into();
        let rtype = spec.resource_type();

        let mut state = self.state.write();
        let current = state
            .get(rtype, key)
            .map(|r| r.meta.clone())
            .ok_or_else(|| StoreError::not_found(rtype, key))?;
        if current.version != version {
            return Err(StoreError::Conflict {
                rtype,
                key: key.clone(),
                expected: version.to_string(),
                actual: current.version,
            });
        }
        let meta = Meta {
            version: state.next_version(),
            modification_time: self.clock.now(),
            ..current
        };
        tracing::debug!(%rtype, %key, version = %meta.version, "Updated");
        state
            .resources
            .entry(rtype)
            .or_default()
            .insert(key.clone(), Resource {
                meta: meta.clone(),
                spec,
            });
        Ok(meta)
    }

    /// Creates the resource or replaces the spec of an existing one.
    pub fn upsert(
        &self,
        mesh: &str,
        name: &str,
        spec: impl Into<Spec>,
    ) -> Result<Meta, StoreError> {
        let spec = spec.into();
        let key = ResourceKey::new(mesh, name);
        let current = self
            .state
            .read()
            .get(spec.resource_type(), &key)
            .map(|r| r.meta.version.clone());
        match current {
            Some(version) => self.update(&key, spec, &version),
            None => self.create(mesh, name, spec),
        }
    }

    pub fn delete(&self, rtype: ResourceType, key: &ResourceKey) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let removed = state
            .resources
            .get_mut(&rtype)
            .and_then(|resources| resources.remove(key));
        if removed.is_none() {
            return Err(StoreError::not_found(rtype, key));
        }
        tracing::debug!(%rtype, %key, "Deleted");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.state.read().resources.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, rtype: ResourceType, key: &ResourceKey) -> Result<Resource, StoreError> {
        self.state
            .read()
            .get(rtype, key)
            .cloned()
            .ok_or_else(|| StoreError::not_found(rtype, key))
    }

    async fn list(
        &self,
        rtype: ResourceType,
        mesh: Option<&str>,
    ) -> Result<Vec<Resource>, StoreError> {
        let state = self.state.read();
        let Some(resources) = state.resources.get(&rtype) else {
            return Ok(vec![]);
        };
        Ok(resources
            .values()
            .filter(|r| mesh.map(|m| r.meta.mesh == m).unwrap_or(true))
            .cloned()
            .collect())
    }
}

// === impl State ===

impl State {
    fn get(&self, rtype: ResourceType, key: &ResourceKey) -> Option<&Resource> {
        self.resources.get(&rtype)?.get(key)
    }

    fn next_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

fn validate_key(rtype: ResourceType, key: &ResourceKey) -> Result<(), StoreError> {
    let reason = if key.name.is_empty() {
        "name must not be empty"
    } else if rtype.is_global() && !key.mesh.is_empty() {
        "global resources must not have a mesh"
    } else if !rtype.is_global() && key.mesh.is_empty() {
        "mesh must not be empty"
    } else {
        return Ok(());
    };
    Err(StoreError::InvalidKey {
        rtype,
        key: key.clone(),
        reason,
    })
}
