//! Object store seam
//!
//! All reads and writes go through [`ObjectStore`], which works on
//! `DynamicObject`s so one implementation covers typed and untyped kinds.
//! [`ClusterClient`] layers typed access and `create_or_update` on top.
//! `KubeStore` talks to the API server; `MemoryStore` backs tests and
//! dry runs.

mod cluster;
pub mod memory;
mod selector;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

pub use cluster::KubeStore;
pub use memory::MemoryStore;
pub use selector::Selector;

use crate::error::Result;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<DynamicObject>>;

    async fn create(&self, resource: &ApiResource, object: &DynamicObject)
        -> Result<DynamicObject>;

    /// Full update. Fails with `Conflict` when the object's resourceVersion is stale.
    async fn replace(
        &self,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject>;

    /// Returns whether the object existed.
    async fn delete(&self, resource: &ApiResource, namespace: Option<&str>, name: &str)
        -> Result<bool>;
}

/// Kinds the typed client can carry.
pub trait Object:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> Object for T where
    T: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// What `create_or_update` ended up doing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Created,
    Updated,
    Unchanged,
}

pub fn api_resource<K: Object>() -> ApiResource {
    ApiResource::erase::<K>(&())
}

fn with_type_meta<K: Object>(mut value: Value) -> Value {
    if let Some(map) = value.as_object_mut() {
        map.insert(
            "apiVersion".to_string(),
            Value::String(K::api_version(&()).into_owned()),
        );
        map.insert("kind".to_string(), Value::String(K::kind(&()).into_owned()));
    }
    value
}

pub fn to_dynamic<K: Object>(object: &K) -> Result<DynamicObject> {
    let value = with_type_meta::<K>(serde_json::to_value(object)?);
    Ok(serde_json::from_value(value)?)
}

pub fn from_dynamic<K: Object>(object: DynamicObject) -> Result<K> {
    let value = with_type_meta::<K>(serde_json::to_value(&object)?);
    Ok(serde_json::from_value(value)?)
}

/// Typed access over an [`ObjectStore`]
#[derive(Clone)]
pub struct ClusterClient {
    store: Arc<dyn ObjectStore>,
}

impl ClusterClient {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        match self.store.get(&api_resource::<K>(), namespace, name).await? {
            Some(obj) => Ok(Some(from_dynamic(obj)?)),
            None => Ok(None),
        }
    }

    pub async fn list<K: Object>(
        &self,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<K>> {
        self.store
            .list(&api_resource::<K>(), namespace, selector)
            .await?
            .into_iter()
            .map(from_dynamic)
            .collect()
    }

    pub async fn create<K: Object>(&self, object: &K) -> Result<K> {
        let created = self
            .store
            .create(&api_resource::<K>(), &to_dynamic(object)?)
            .await?;
        from_dynamic(created)
    }

    pub async fn update<K: Object>(&self, object: &K) -> Result<K> {
        let updated = self
            .store
            .replace(&api_resource::<K>(), &to_dynamic(object)?)
            .await?;
        from_dynamic(updated)
    }

    pub async fn delete<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<bool> {
        self.store
            .delete(&api_resource::<K>(), namespace, name)
            .await
    }

    /// Writes `after` only when it differs from `before`. Returns whether a write happened.
    pub async fn update_if_changed<K: Object>(&self, before: &K, after: &K) -> Result<bool> {
        if serde_json::to_value(before)? == serde_json::to_value(after)? {
            return Ok(false);
        }
        self.update(after).await?;
        Ok(true)
    }

    /// Fetches the named object (or starts from an empty one carrying only its
    /// name and namespace), applies `mutate` and persists the result.
    ///
    /// `mutate` sees `metadata.creationTimestamp == None` exactly when the
    /// object is about to be created. No write is issued when the mutation
    /// leaves an existing object unchanged.
    pub async fn create_or_update<K, F>(
        &self,
        namespace: Option<&str>,
        name: &str,
        mutate: F,
    ) -> Result<(K, Operation)>
    where
        K: Object + Default,
        F: FnOnce(&mut K) -> Result<()> + Send,
    {
        match self.get::<K>(namespace, name).await? {
            None => {
                let mut object = K::default();
                object.meta_mut().name = Some(name.to_string());
                object.meta_mut().namespace = namespace.map(str::to_string);
                mutate(&mut object)?;
                let created = self.create(&object).await?;
                debug!(kind = %K::kind(&()), name, "created");
                Ok((created, Operation::Created))
            }
            Some(existing) => {
                let mut desired = existing.clone();
                mutate(&mut desired)?;
                if serde_json::to_value(&existing)? == serde_json::to_value(&desired)? {
                    return Ok((existing, Operation::Unchanged));
                }
                let updated = self.update(&desired).await?;
                debug!(kind = %K::kind(&()), name, "updated");
                Ok((updated, Operation::Updated))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use std::collections::BTreeMap;

    fn client() -> (ClusterClient, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (ClusterClient::new(store.clone()), store)
    }

    fn set_data(cm: &mut ConfigMap, key: &str, value: &str) {
        cm.data
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
    }

    #[tokio::test]
    async fn test_create_or_update_creates_then_skips_noop() {
        let (client, store) = client();

        let (cm, op) = client
            .create_or_update::<ConfigMap, _>(Some("app"), "settings", |cm| {
                assert!(cm.metadata.creation_timestamp.is_none());
                set_data(cm, "k", "v");
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(op, Operation::Created);
        assert!(cm.metadata.uid.is_some());
        let writes = store.mutation_count();

        let (_, op) = client
            .create_or_update::<ConfigMap, _>(Some("app"), "settings", |cm| {
                assert!(cm.metadata.creation_timestamp.is_some());
                set_data(cm, "k", "v");
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(op, Operation::Unchanged);
        assert_eq!(store.mutation_count(), writes);
    }

    #[tokio::test]
    async fn test_create_or_update_updates_on_change() {
        let (client, _) = client();
        client
            .create_or_update::<ConfigMap, _>(Some("app"), "settings", |cm| {
                set_data(cm, "k", "v1");
                Ok(())
            })
            .await
            .unwrap();

        let (cm, op) = client
            .create_or_update::<ConfigMap, _>(Some("app"), "settings", |cm| {
                set_data(cm, "k", "v2");
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(op, Operation::Updated);
        assert_eq!(cm.data.unwrap()["k"], "v2");
    }

    #[tokio::test]
    async fn test_mutate_error_aborts_write() {
        let (client, store) = client();
        let result = client
            .create_or_update::<ConfigMap, _>(Some("app"), "settings", |_| {
                Err(crate::Error::ValidationError("refused".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(store.mutation_count(), 0);
    }

    #[test]
    fn test_dynamic_conversion_keeps_type_meta() {
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some("settings".to_string());
        let dynamic = to_dynamic(&cm).unwrap();
        let types = dynamic.types.clone().unwrap();
        assert_eq!(types.api_version, "v1");
        assert_eq!(types.kind, "ConfigMap");

        let back: ConfigMap = from_dynamic(dynamic).unwrap();
        assert_eq!(back.metadata.name.as_deref(), Some("settings"));
    }
}
