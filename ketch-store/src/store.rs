use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use ketch_base::{err, Result};
use ketch_model::{Resource, ResourceType};

use crate::persistence::Persistence;

/// Validation failure for a `create` call, with the HTTP-ish status code
/// the management API maps it to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    MissingName,
    DuplicateName(String),
    DuplicateId(Uuid),
    InitRejected(String),
}

impl ValidationError {
    pub fn status_code(&self) -> u16 {
        match self {
            ValidationError::MissingName => 400,
            ValidationError::DuplicateName(_) => 409,
            ValidationError::DuplicateId(_) => 500,
            ValidationError::InitRejected(_) => 400,
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::MissingName => write!(f, "resource missing name"),
            ValidationError::DuplicateName(name) => write!(f, "resource name {name} already exists"),
            ValidationError::DuplicateId(id) => write!(f, "resource id {id} already exists"),
            ValidationError::InitRejected(reason) => write!(f, "resource rejected: {reason}"),
        }
    }
}

/// Per-type behavior the generic store cannot know on its own: how to
/// validate/initialize a freshly created resource, how to refresh a
/// derived list (Server is refreshed from membership, for example), and
/// what to do with a resource just loaded from disk before it rejoins
/// the live set.
pub trait ResourceHooks<T>: Send + Sync {
    fn init(&self, _existing: &[T], _candidate: &mut T) -> std::result::Result<(), ValidationError> {
        Ok(())
    }

    fn refresh_list(&self) -> Option<Vec<T>> {
        None
    }

    /// Returns true if `resource` was mutated and must be re-persisted.
    fn update_after_load(&self, _resource: &mut T) -> bool {
        false
    }
}

/// Hooks for a resource type the store never validates or refreshes
/// beyond the default name/id checks.
pub struct NoHooks;
impl<T> ResourceHooks<T> for NoHooks {}

/// Generic in-memory resource collection with optional name uniqueness,
/// id assignment, and persistence, mirroring the original `ResourceMgr`:
/// one instance per `ResourceType`, all guarded by the caller's single
/// store-wide lock.
pub struct ResourceMgr<T, H = NoHooks> {
    resource_type: ResourceType,
    assign_ids: bool,
    named: bool,
    persist: bool,
    resources: BTreeMap<Uuid, T>,
    by_name: BTreeMap<String, Uuid>,
    hooks: H,
    persistence: Option<Arc<Persistence>>,
}

impl<T, H> ResourceMgr<T, H>
where
    T: Resource + Clone + Serialize + DeserializeOwned,
    H: ResourceHooks<T>,
{
    pub fn new(
        resource_type: ResourceType,
        assign_ids: bool,
        named: bool,
        persist: bool,
        hooks: H,
        persistence: Option<Arc<Persistence>>,
    ) -> Result<Self> {
        if persist && persistence.is_none() {
            return Err(err(format!(
                "resource type {} requires persistence but none was provided",
                resource_type.as_str()
            )));
        }
        let mut mgr = ResourceMgr {
            resource_type,
            assign_ids,
            named,
            persist,
            resources: BTreeMap::new(),
            by_name: BTreeMap::new(),
            hooks,
            persistence,
        };
        if mgr.persist {
            mgr.load()?;
        }
        Ok(mgr)
    }

    fn table_name(&self) -> &'static str {
        self.resource_type.as_str()
    }

    /// Clears the in-memory set and repopulates it from `hooks.refresh_list()`,
    /// if the type has one, then returns a sorted deep copy.
    pub fn get(&mut self) -> Result<Vec<T>> {
        if let Some(list) = self.hooks.refresh_list() {
            self.resources.clear();
            self.by_name.clear();
            self.create(list).map_err(|e| err(e.to_string()))?;
        }
        let mut list: Vec<T> = self.resources.values().cloned().collect();
        list.sort_by(|a, b| a.common().id.cmp(&b.common().id));
        Ok(list)
    }

    /// Validates and inserts `list`, persisting it if this type persists.
    /// Returns the stored (possibly id-assigned) copies on success.
    pub fn create(&mut self, list: Vec<T>) -> std::result::Result<Vec<T>, CreateError> {
        let mut list = list;

        for candidate in list.iter_mut() {
            let common = candidate.common().clone();
            if self.named && common.name.is_empty() {
                return Err(CreateError::Validation(ValidationError::MissingName));
            }
            if self.named && self.by_name.contains_key(&common.name) {
                return Err(CreateError::Validation(ValidationError::DuplicateName(common.name)));
            }
            if self.assign_ids {
                candidate.common_mut().id = Uuid::new_v4();
            }
            let id = candidate.common().id;
            if self.resources.contains_key(&id) {
                return Err(CreateError::Validation(ValidationError::DuplicateId(id)));
            }
            let existing: Vec<T> = self.resources.values().cloned().collect();
            self.hooks
                .init(&existing, candidate)
                .map_err(CreateError::Validation)?;
        }

        for resource in &list {
            let common = resource.common().clone();
            self.resources.insert(common.id, resource.clone());
            if self.named {
                self.by_name.insert(common.name, common.id);
            }
        }

        if !self.persist {
            return Ok(list);
        }
        if let Some(persistence) = &self.persistence {
            for resource in &list {
                let id = resource.common().id;
                let json = serde_json::to_vec(resource).map_err(|e| CreateError::Persist(err(e.to_string())))?;
                persistence
                    .put(self.table_name(), id, &json)
                    .map_err(CreateError::Persist)?;
            }
        }
        Ok(list)
    }

    /// Re-marshals and overwrites a single resource already in the
    /// in-memory set, or deletes its persisted record if it has been
    /// removed from memory. Failure here is treated as fatal by callers,
    /// matching the source's "no error path, crash instead" policy for a
    /// corrupted store.
    pub fn save(&self, id: Uuid) -> Result<()> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        if !self.persist {
            return Ok(());
        }
        match self.resources.get(&id) {
            None => persistence.delete(self.table_name(), id),
            Some(resource) => {
                let json = serde_json::to_vec(resource)?;
                persistence.put(self.table_name(), id, &json)
            }
        }
    }

    fn load(&mut self) -> Result<()> {
        let Some(persistence) = self.persistence.clone() else {
            return Ok(());
        };
        let rows = persistence.load_all(self.table_name())?;
        for (key_id, json) in rows {
            let mut resource: T = serde_json::from_slice(&json)?;
            let common = resource.common().clone();
            if common.id != key_id {
                return Err(err(format!(
                    "resource key mismatch in {}: key {key_id} record {}",
                    self.table_name(),
                    common.id
                )));
            }
            let needs_resave = self.hooks.update_after_load(&mut resource);
            let id = resource.common().id;
            let name = resource.common().name.clone();
            self.resources.insert(id, resource);
            if self.named {
                self.by_name.insert(name, id);
            }
            if needs_resave {
                self.save(id)?;
            }
        }
        Ok(())
    }

    pub fn get_by_id(&self, id: Uuid) -> Option<T> {
        self.resources.get(&id).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<T> {
        let id = self.by_name.get(name)?;
        self.resources.get(id).cloned()
    }

    /// Replaces the stored copy of `resource` and persists it, matching
    /// the source's read-modify-write pattern for in-place updates (e.g.
    /// the acceptor advancing `highest_promised`).
    pub fn put(&mut self, resource: T) -> Result<()> {
        let common = resource.common().clone();
        self.resources.insert(common.id, resource);
        if self.named {
            self.by_name.insert(common.name, common.id);
        }
        self.save(common.id)
    }

    pub fn remove(&mut self, id: Uuid) -> Result<Option<T>> {
        let removed = self.resources.remove(&id);
        if let Some(resource) = &removed {
            let name = &resource.common().name;
            if self.named {
                self.by_name.remove(name);
            }
        }
        self.save(id)?;
        Ok(removed)
    }
}

#[derive(Debug)]
pub enum CreateError {
    Validation(ValidationError),
    Persist(ketch_base::Error),
}

impl CreateError {
    pub fn status_code(&self) -> u16 {
        match self {
            CreateError::Validation(v) => v.status_code(),
            CreateError::Persist(_) => 500,
        }
    }
}

impl std::fmt::Display for CreateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CreateError::Validation(v) => write!(f, "{v}"),
            CreateError::Persist(e) => write!(f, "{e:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ketch_model::{Common, Endpoint, Runtime, State};
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::SystemTime;
    use tempfile::tempdir;

    fn runtime(name: &str) -> Runtime {
        Runtime {
            common: Common {
                name: name.to_string(),
                id: Uuid::nil(),
                state: State::New,
                pending_state: None,
            },
            endpoint: Endpoint { addr: IpAddr::V4(Ipv4Addr::LOCALHOST), port: 7460 },
            boot_time: SystemTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn create_assigns_ids_and_rejects_duplicate_names() {
        let mut mgr: ResourceMgr<Runtime> =
            ResourceMgr::new(ResourceType::Runtime, true, true, false, NoHooks, None).unwrap();
        let created = mgr.create(vec![runtime("node-a")]).unwrap();
        assert_ne!(created[0].common.id, Uuid::nil());

        let err = mgr.create(vec![runtime("node-a")]).unwrap_err();
        assert_eq!(err.status_code(), 409);
    }

    #[test]
    fn create_rejects_missing_name_when_named() {
        let mut mgr: ResourceMgr<Runtime> =
            ResourceMgr::new(ResourceType::Runtime, true, true, false, NoHooks, None).unwrap();
        let err = mgr.create(vec![runtime("")]).unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn persisted_resources_survive_reload() {
        let dir = tempdir().unwrap();
        let persistence = Arc::new(Persistence::open(dir.path(), "ketch.db").unwrap());

        let id = {
            let mut mgr: ResourceMgr<Runtime> = ResourceMgr::new(
                ResourceType::Runtime,
                true,
                true,
                true,
                NoHooks,
                Some(persistence.clone()),
            )
            .unwrap();
            let created = mgr.create(vec![runtime("node-a")]).unwrap();
            created[0].common.id
        };

        let mut reloaded: ResourceMgr<Runtime> = ResourceMgr::new(
            ResourceType::Runtime,
            true,
            true,
            true,
            NoHooks,
            Some(persistence),
        )
        .unwrap();
        let list = reloaded.get().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].common.id, id);
    }
}
