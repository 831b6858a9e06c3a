//! Engine configuration and the group manifest consumed by the CLI

use std::path::Path;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::controller::naming::cron_from_interval;
use crate::crd::{CopyMethod, GroupOwner, ProtectedVolume, ReplicationState};
use crate::error::{Error, Result};

pub const DEFAULT_READ_ONLY_MANY_DRIVER: &str = "openshift-storage.cephfs.csi.ceph.com";
pub const DEFAULT_RSYNC_SERVICE_TYPE: &str = "ClusterIP";

const SUPPORTED_SERVICE_TYPES: &[&str] = &["ClusterIP", "LoadBalancer"];

/// Whether snapshot pruning spares snapshots carrying the do-not-delete label
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SnapshotPrunePolicy {
    /// Prune every superseded snapshot
    #[default]
    IgnoreProtection,
    /// Keep superseded snapshots labelled do-not-delete
    SkipProtected,
}

/// Per-group settings that shape the replication objects
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Sync interval such as `10m`, `1h`, `2d`; unset means the default schedule
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduling_interval: Option<String>,

    /// Narrows the snapshot classes considered by the resolver
    #[schemars(with = "serde_json::Value")]
    pub volume_snapshot_class_selector: LabelSelector,

    /// Provisioner whose temporary and rollback claims must be ReadOnlyMany
    pub read_only_many_driver: String,

    pub destination_copy_method: CopyMethod,

    /// The group lives in an admin namespace, so owner references to it
    /// cannot be placed on objects in application namespaces
    pub admin_namespace: bool,

    pub rsync_service_type: String,

    pub snapshot_prune_policy: SnapshotPrunePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scheduling_interval: None,
            volume_snapshot_class_selector: LabelSelector::default(),
            read_only_many_driver: DEFAULT_READ_ONLY_MANY_DRIVER.to_string(),
            destination_copy_method: CopyMethod::Snapshot,
            admin_namespace: false,
            rsync_service_type: DEFAULT_RSYNC_SERVICE_TYPE.to_string(),
            snapshot_prune_policy: SnapshotPrunePolicy::IgnoreProtection,
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(interval) = &self.scheduling_interval {
            cron_from_interval(interval)
                .map_err(|e| Error::ConfigError(format!("schedulingInterval: {e}")))?;
        }
        if !SUPPORTED_SERVICE_TYPES.contains(&self.rsync_service_type.as_str()) {
            return Err(Error::ConfigError(format!(
                "rsyncServiceType must be one of {SUPPORTED_SERVICE_TYPES:?}, got {}",
                self.rsync_service_type
            )));
        }
        Ok(())
    }

    pub fn is_copy_method_direct(&self) -> bool {
        self.destination_copy_method == CopyMethod::Direct
    }
}

/// Per-volume action flags set by the group controller for this pass
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct VolumeActions {
    pub run_final_sync: bool,
    pub prep_final_sync: bool,
    pub failover_action: bool,
    /// Restore the application claim from the destination before sourcing
    pub restore: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeEntry {
    #[serde(flatten)]
    pub volume: ProtectedVolume,

    #[serde(default)]
    pub actions: VolumeActions,
}

/// Everything one reconcile pass needs: who owns the objects, which role the
/// group holds here and the protected volumes
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GroupManifest {
    pub owner: GroupOwner,

    #[serde(default)]
    pub role: ReplicationState,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub volumes: Vec<VolumeEntry>,
}

impl GroupManifest {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let manifest: Self = serde_yaml::from_str(&raw)?;
        manifest.engine.validate()?;
        Ok(manifest)
    }

    pub fn protected_volumes(&self) -> Vec<ProtectedVolume> {
        self.volumes.iter().map(|v| v.volume.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = EngineConfig::from_yaml("schedulingInterval: 5m\n").unwrap();
        assert_eq!(config.scheduling_interval.as_deref(), Some("5m"));
        assert_eq!(config.rsync_service_type, "ClusterIP");
        assert_eq!(config.read_only_many_driver, DEFAULT_READ_ONLY_MANY_DRIVER);
        assert_eq!(config.snapshot_prune_policy, SnapshotPrunePolicy::IgnoreProtection);
        assert!(!config.is_copy_method_direct());
    }

    #[test]
    fn test_bad_interval_is_config_error() {
        let err = EngineConfig::from_yaml("schedulingInterval: 5x\n").unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn test_unknown_service_type_rejected() {
        let err = EngineConfig::from_yaml("rsyncServiceType: NodePort\n").unwrap_err();
        assert!(err.to_string().contains("rsyncServiceType"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "destinationCopyMethod: Direct\nadminNamespace: true\nsnapshotPrunePolicy: SkipProtected\nvolumeSnapshotClassSelector:\n  matchLabels:\n    tier: gold"
        )
        .unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert!(config.is_copy_method_direct());
        assert!(config.admin_namespace);
        assert_eq!(config.snapshot_prune_policy, SnapshotPrunePolicy::SkipProtected);
        assert_eq!(
            config
                .volume_snapshot_class_selector
                .match_labels
                .unwrap()
                .get("tier")
                .map(String::as_str),
            Some("gold")
        );
    }

    #[test]
    fn test_manifest_parses_flattened_volumes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
owner:
  name: vrg-app
  namespace: app
  uid: 7f1c
role: Secondary
volumes:
  - name: app-data
    namespace: app
    protectedByVolsync: true
    storageClassName: rbd
    capacity: 10Gi
    actions:
      failoverAction: true
"#
        )
        .unwrap();

        let manifest = GroupManifest::from_file(file.path()).unwrap();
        assert_eq!(manifest.role, ReplicationState::Secondary);
        assert_eq!(manifest.owner.kind, "VolumeReplicationGroup");
        assert_eq!(manifest.volumes.len(), 1);
        let entry = &manifest.volumes[0];
        assert_eq!(entry.volume.capacity.as_ref().map(|q| q.0.as_str()), Some("10Gi"));
        assert!(entry.actions.failover_action);
        assert!(!entry.actions.run_final_sync);
    }
}
