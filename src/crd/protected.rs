//! Inputs handed to the engine by the replication-group controller

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Replication role of the owning group on this cluster
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ReplicationState {
    /// Application runs here; volumes are pushed out
    #[default]
    Primary,
    /// Volumes are received here
    Secondary,
}

impl std::fmt::Display for ReplicationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicationState::Primary => write!(f, "primary"),
            ReplicationState::Secondary => write!(f, "secondary"),
        }
    }
}

/// Identity of the replication group that owns every object the engine creates
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GroupOwner {
    #[serde(default = "default_owner_api_version")]
    pub api_version: String,

    #[serde(default = "default_owner_kind")]
    pub kind: String,

    pub name: String,

    pub namespace: String,

    /// Needed for owner references; may be empty when running without a cluster
    #[serde(default)]
    pub uid: String,

    /// Annotations on the group object; platform-tagged ones are replayed onto restored claims
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

fn default_owner_api_version() -> String {
    "ramendr.openshift.io/v1alpha1".to_string()
}

fn default_owner_kind() -> String {
    "VolumeReplicationGroup".to_string()
}

impl GroupOwner {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            api_version: default_owner_api_version(),
            kind: default_owner_kind(),
            name: name.into(),
            namespace: namespace.into(),
            uid: uid.into(),
            annotations: BTreeMap::new(),
        }
    }

    /// Owner reference pointing at the group. `controller` marks it as the
    /// managing controller; plain references only tie lifetimes together.
    pub fn owner_reference(&self, controller: bool) -> OwnerReference {
        OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: controller.then_some(true),
            block_owner_deletion: controller.then_some(true),
        }
    }
}

/// A claim the replication group protects, as recorded in the group's status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProtectedVolume {
    pub name: String,

    pub namespace: String,

    #[serde(default)]
    pub protected_by_volsync: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<String>,

    /// Requested size of the claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub capacity: Option<Quantity>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mode: Option<String>,
}

impl ProtectedVolume {
    /// Rejects inputs the engine cannot act on.
    pub fn validate(&self) -> crate::Result<()> {
        if !self.protected_by_volsync {
            return Err(crate::Error::ValidationError(format!(
                "claim {}/{} is not protected by the data mover",
                self.namespace, self.name
            )));
        }
        if self.name.is_empty() || self.namespace.is_empty() {
            return Err(crate::Error::ValidationError(
                "protected claim needs both a name and a namespace".to_string(),
            ));
        }
        if self.storage_class_name.as_deref().unwrap_or("").is_empty() {
            return Err(crate::Error::ValidationError(format!(
                "no storageClassName given for claim {}/{}",
                self.namespace, self.name
            )));
        }
        Ok(())
    }

    /// Access modes with the single-writer fallback applied.
    pub fn access_modes_or_default(&self) -> Vec<String> {
        if self.access_modes.is_empty() {
            vec!["ReadWriteOnce".to_string()]
        } else {
            self.access_modes.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume() -> ProtectedVolume {
        ProtectedVolume {
            name: "app-data".to_string(),
            namespace: "app".to_string(),
            protected_by_volsync: true,
            storage_class_name: Some("rbd".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_accepts_complete_volume() {
        assert!(volume().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unprotected() {
        let mut v = volume();
        v.protected_by_volsync = false;
        let err = v.validate().unwrap_err();
        assert!(err.to_string().contains("not protected"));
    }

    #[test]
    fn test_validate_rejects_missing_storage_class() {
        let mut v = volume();
        v.storage_class_name = Some(String::new());
        assert!(v.validate().is_err());
        v.storage_class_name = None;
        assert!(v.validate().is_err());
    }

    #[test]
    fn test_access_modes_default_to_rwo() {
        let mut v = volume();
        assert_eq!(v.access_modes_or_default(), vec!["ReadWriteOnce"]);
        v.access_modes = vec!["ReadWriteMany".to_string()];
        assert_eq!(v.access_modes_or_default(), vec!["ReadWriteMany"]);
    }

    #[test]
    fn test_owner_reference_controller_flag() {
        let owner = GroupOwner::new("vrg-app", "app", "1234");
        let controller = owner.owner_reference(true);
        assert_eq!(controller.controller, Some(true));
        assert_eq!(controller.kind, "VolumeReplicationGroup");
        let plain = owner.owner_reference(false);
        assert_eq!(plain.controller, None);
        assert_eq!(plain.block_owner_deletion, None);
    }
}
