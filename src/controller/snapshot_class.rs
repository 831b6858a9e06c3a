//! Snapshot class resolution for a storage class

use k8s_openapi::api::storage::v1::StorageClass;
use kube::ResourceExt;
use tracing::debug;

use super::handler::ReplicationHandler;
use crate::crd::VolumeSnapshotClass;
use crate::error::{Error, Result};
use crate::store::Selector;

pub const IS_DEFAULT_CLASS_ANNOTATION: &str = "snapshot.storage.kubernetes.io/is-default-class";

/// Correlates storage and snapshot classes backed by the same storage instance
pub const STORAGE_ID_LABEL: &str = "ramendr.openshift.io/storageid";

fn storage_id<K: kube::Resource>(object: &K) -> Option<&str> {
    object
        .meta()
        .labels
        .as_ref()
        .and_then(|l| l.get(STORAGE_ID_LABEL))
        .map(String::as_str)
}

/// Picks the class for `storage_class`: same driver, compatible storage id,
/// the default-annotated one on ties, else the first match.
pub fn select_snapshot_class(
    classes: &[VolumeSnapshotClass],
    storage_class: &StorageClass,
) -> Option<String> {
    let wanted_id = storage_id(storage_class);
    let mut matches = classes.iter().filter(|class| {
        class.driver == storage_class.provisioner
            && match storage_id(*class) {
                None => true,
                Some(id) => Some(id) == wanted_id,
            }
    });

    let first = matches.next()?;
    let default = std::iter::once(first).chain(matches).find(|class| {
        class
            .annotations()
            .get(IS_DEFAULT_CLASS_ANNOTATION)
            .is_some_and(|v| v == "true")
    });

    Some(default.unwrap_or(first).name_any())
}

impl ReplicationHandler {
    pub(crate) async fn storage_class(&self, name: Option<&str>) -> Result<StorageClass> {
        let name = name
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::ValidationError("no storageClassName given".to_string()))?;
        self.client
            .get::<StorageClass>(None, name)
            .await?
            .ok_or_else(|| Error::not_found("StorageClass", name))
    }

    /// Classes matching the configured selector, listed once per handler.
    async fn snapshot_classes(&self) -> Result<&[VolumeSnapshotClass]> {
        let classes = self
            .snapshot_classes
            .get_or_try_init(|| async {
                let selector =
                    Selector::from_label_selector(&self.config.volume_snapshot_class_selector);
                let classes: Vec<VolumeSnapshotClass> = self.client.list(None, &selector).await?;
                debug!(count = classes.len(), "loaded snapshot classes");
                Ok::<_, Error>(classes)
            })
            .await?;
        Ok(classes.as_slice())
    }

    pub(crate) async fn snapshot_class_for(&self, storage_class: &StorageClass) -> Result<String> {
        let classes = self.snapshot_classes().await?;
        select_snapshot_class(classes, storage_class).ok_or_else(|| {
            Error::ValidationError(format!(
                "unable to find matching volume snapshot class for provisioner {}",
                storage_class.provisioner
            ))
        })
    }

    /// Snapshot class to use for volumes of the named storage class.
    pub async fn snapshot_class_for_storage_class(&self, name: Option<&str>) -> Result<String> {
        let storage_class = self.storage_class(name).await?;
        self.snapshot_class_for(&storage_class).await
    }
}
