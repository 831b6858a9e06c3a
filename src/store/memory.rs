//! In-process object store
//!
//! Emulates the API-server behaviour the engine relies on: uid, resourceVersion
//! and creationTimestamp assignment, optimistic concurrency on replace, status
//! preserved across spec updates, finalizer-gated deletion and owner-reference
//! garbage collection. Used by the test suites and by `--dry-run`.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use serde_json::Value;

use super::{api_resource, from_dynamic, to_dynamic, Object, ObjectStore, Selector};
use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Key {
    api_version: String,
    kind: String,
    namespace: String,
    name: String,
}

impl Key {
    fn new(resource: &ApiResource, namespace: Option<&str>, name: &str) -> Self {
        Self {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
            namespace: namespace.unwrap_or_default().to_string(),
            name: name.to_string(),
        }
    }

    fn for_object(resource: &ApiResource, object: &DynamicObject) -> Result<Self> {
        let name = object
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::ValidationError("object has no metadata.name".to_string()))?;
        Ok(Self::new(resource, object.metadata.namespace.as_deref(), name))
    }

    fn display(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.namespace, self.name)
        }
    }
}

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, DynamicObject>,
    next_uid: u64,
    next_version: u64,
    mutations: usize,
}

impl State {
    fn stamp_new(&mut self, object: &mut DynamicObject) {
        self.next_uid += 1;
        self.next_version += 1;
        if object.metadata.uid.is_none() {
            object.metadata.uid = Some(format!("00000000-0000-0000-0000-{:012}", self.next_uid));
        }
        object.metadata.resource_version = Some(self.next_version.to_string());
        if object.metadata.creation_timestamp.is_none() {
            object.metadata.creation_timestamp = Some(Time(Utc::now()));
        }
    }

    fn bump_version(&mut self, object: &mut DynamicObject) {
        self.next_version += 1;
        object.metadata.resource_version = Some(self.next_version.to_string());
    }

    /// Removes `key` and garbage-collects everything it owns, honouring finalizers.
    fn remove_cascading(&mut self, key: &Key) {
        let mut pending = vec![key.clone()];
        while let Some(next) = pending.pop() {
            let Some(removed) = self.objects.remove(&next) else {
                continue;
            };
            let Some(uid) = removed.metadata.uid else {
                continue;
            };

            let dependents: Vec<Key> = self
                .objects
                .iter()
                .filter(|(_, obj)| {
                    obj.metadata
                        .owner_references
                        .iter()
                        .flatten()
                        .any(|o| o.uid == uid)
                })
                .map(|(k, _)| k.clone())
                .collect();

            for dependent in dependents {
                if let Some(obj) = self.objects.get_mut(&dependent) {
                    if has_finalizers(obj) {
                        if obj.metadata.deletion_timestamp.is_none() {
                            obj.metadata.deletion_timestamp = Some(Time(Utc::now()));
                        }
                    } else {
                        pending.push(dependent);
                    }
                }
            }
        }
    }
}

fn has_finalizers(object: &DynamicObject) -> bool {
    object
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| !f.is_empty())
}

fn take_status(object: &mut DynamicObject) -> Option<Value> {
    object.data.as_object_mut().and_then(|m| m.remove("status"))
}

fn put_status(object: &mut DynamicObject, status: Option<Value>) {
    if let (Some(map), Some(status)) = (object.data.as_object_mut(), status) {
        map.insert("status".to_string(), status);
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of writes (create, replace, delete) the store has accepted.
    pub fn mutation_count(&self) -> usize {
        self.lock().mutations
    }

    /// Stores `object` as-is, status included, bypassing create semantics.
    /// Seeding does not count as a mutation.
    pub fn insert<K: Object>(&self, object: &K) -> Result<K> {
        let resource = api_resource::<K>();
        let mut dynamic = to_dynamic(object)?;
        let key = Key::for_object(&resource, &dynamic)?;
        let mut state = self.lock();
        state.stamp_new(&mut dynamic);
        state.objects.insert(key, dynamic.clone());
        drop(state);
        from_dynamic(dynamic)
    }

    /// Overwrites the status of a stored object, the way a controller writing
    /// to the status subresource would.
    pub fn set_status<K: Object>(
        &self,
        namespace: Option<&str>,
        name: &str,
        status: Value,
    ) -> Result<()> {
        let key = Key::new(&api_resource::<K>(), namespace, name);
        let mut state = self.lock();
        let Some(mut object) = state.objects.get(&key).cloned() else {
            return Err(Error::not_found(K::kind(&()), key.display()));
        };
        take_status(&mut object);
        put_status(&mut object, Some(status));
        state.bump_version(&mut object);
        state.objects.insert(key, object);
        Ok(())
    }

    /// Synchronous typed read for assertions.
    pub fn fetch<K: Object>(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        let key = Key::new(&api_resource::<K>(), namespace, name);
        let object = self.lock().objects.get(&key).cloned()?;
        from_dynamic(object).ok()
    }

    pub fn contains<K: Object>(&self, namespace: Option<&str>, name: &str) -> bool {
        let key = Key::new(&api_resource::<K>(), namespace, name);
        self.lock().objects.contains_key(&key)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        let key = Key::new(resource, namespace, name);
        Ok(self.lock().objects.get(&key).cloned())
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<DynamicObject>> {
        let state = self.lock();
        Ok(state
            .objects
            .iter()
            .filter(|(k, _)| k.api_version == resource.api_version && k.kind == resource.kind)
            .filter(|(k, _)| namespace.map_or(true, |ns| k.namespace == ns))
            .filter(|(_, obj)| selector.matches(obj.metadata.labels.as_ref()))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(
        &self,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        let key = Key::for_object(resource, object)?;
        let mut state = self.lock();
        if state.objects.contains_key(&key) {
            return Err(Error::Conflict(format!(
                "{} {} already exists",
                resource.kind,
                key.display()
            )));
        }

        let mut created = object.clone();
        created.metadata.uid = None;
        created.metadata.creation_timestamp = None;
        created.metadata.deletion_timestamp = None;
        take_status(&mut created);
        state.stamp_new(&mut created);
        state.mutations += 1;
        state.objects.insert(key, created.clone());
        Ok(created)
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        let key = Key::for_object(resource, object)?;
        let mut state = self.lock();
        let Some(stored) = state.objects.get(&key).cloned() else {
            return Err(Error::not_found(resource.kind.clone(), key.display()));
        };

        if let Some(version) = object.metadata.resource_version.as_deref() {
            if stored.metadata.resource_version.as_deref() != Some(version) {
                return Err(Error::Conflict(format!(
                    "{} {} has been modified",
                    resource.kind,
                    key.display()
                )));
            }
        }

        let mut updated = object.clone();
        updated.metadata.uid = stored.metadata.uid.clone();
        updated.metadata.creation_timestamp = stored.metadata.creation_timestamp.clone();
        updated.metadata.deletion_timestamp = stored.metadata.deletion_timestamp.clone();
        take_status(&mut updated);
        let mut stored = stored;
        put_status(&mut updated, take_status(&mut stored));
        state.bump_version(&mut updated);
        state.mutations += 1;

        if updated.metadata.deletion_timestamp.is_some() && !has_finalizers(&updated) {
            state.remove_cascading(&key);
        } else {
            state.objects.insert(key, updated.clone());
        }
        Ok(updated)
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<bool> {
        let key = Key::new(resource, namespace, name);
        let mut state = self.lock();
        let Some(object) = state.objects.get_mut(&key) else {
            return Ok(false);
        };

        if has_finalizers(object) {
            if object.metadata.deletion_timestamp.is_none() {
                object.metadata.deletion_timestamp = Some(Time(Utc::now()));
                state.mutations += 1;
            }
            return Ok(true);
        }

        state.remove_cascading(&key);
        state.mutations += 1;
        Ok(true)
    }
}
