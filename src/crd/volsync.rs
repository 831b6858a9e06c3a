//! Data-mover replication objects (`volsync.backube/v1alpha1`)
//!
//! ReplicationDestination receives a volume over rsync-TLS, ReplicationSource
//! pushes one. Only the rsync-TLS mover is modelled.

use k8s_openapi::api::core::v1::TypedLocalObjectReference;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How the data mover materializes replicated data
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CopyMethod {
    /// Transfer into a scratch volume and snapshot it after every sync
    #[default]
    Snapshot,
    /// Transfer straight into a pre-existing claim
    Direct,
}

impl std::fmt::Display for CopyMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CopyMethod::Snapshot => write!(f, "Snapshot"),
            CopyMethod::Direct => write!(f, "Direct"),
        }
    }
}

// ─── ReplicationDestination ──────────────────────────────────────────────────

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "volsync.backube",
    version = "v1alpha1",
    kind = "ReplicationDestination",
    namespaced,
    status = "ReplicationDestinationStatus",
    derive = "Default",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationDestinationSpec {
    #[serde(rename = "rsyncTLS", skip_serializing_if = "Option::is_none")]
    pub rsync_tls: Option<ReplicationDestinationRsyncTlsSpec>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub paused: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationDestinationRsyncTlsSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,

    /// Secret holding the pre-shared key both movers authenticate with
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_secret: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub copy_method: Option<CopyMethod>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<Quantity>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_class_name: Option<String>,

    /// Pre-existing claim to receive into (direct copy)
    #[serde(rename = "destinationPVC", skip_serializing_if = "Option::is_none")]
    pub destination_pvc: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationDestinationStatus {
    #[serde(rename = "rsyncTLS", skip_serializing_if = "Option::is_none")]
    pub rsync_tls: Option<ReplicationDestinationRsyncTlsStatus>,

    /// Snapshot produced by the most recent completed sync
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_image: Option<TypedLocalObjectReference>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<Time>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationDestinationRsyncTlsStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl ReplicationDestination {
    /// Address the destination mover listens on, once the data mover has assigned one.
    pub fn address(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.rsync_tls.as_ref())
            .and_then(|r| r.address.as_deref())
            .filter(|a| !a.is_empty())
    }

    pub fn latest_image(&self) -> Option<&TypedLocalObjectReference> {
        self.status.as_ref().and_then(|s| s.latest_image.as_ref())
    }
}

// ─── ReplicationSource ───────────────────────────────────────────────────────

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "volsync.backube",
    version = "v1alpha1",
    kind = "ReplicationSource",
    namespaced,
    status = "ReplicationSourceStatus",
    derive = "Default",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSourceSpec {
    #[serde(rename = "sourcePVC", default)]
    pub source_pvc: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<ReplicationSourceTriggerSpec>,

    #[serde(rename = "rsyncTLS", skip_serializing_if = "Option::is_none")]
    pub rsync_tls: Option<ReplicationSourceRsyncTlsSpec>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub paused: bool,
}

/// Either a cron schedule or a one-shot manual tag; never both.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSourceTriggerSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub manual: Option<String>,
}

impl ReplicationSourceTriggerSpec {
    pub fn scheduled(cron: impl Into<String>) -> Self {
        Self {
            schedule: Some(cron.into()),
            manual: None,
        }
    }

    pub fn manual(tag: impl Into<String>) -> Self {
        Self {
            schedule: None,
            manual: Some(tag.into()),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSourceRsyncTlsSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_secret: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub copy_method: Option<CopyMethod>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_class_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSourceStatus {
    /// Echo of the last manual trigger tag that finished
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_manual_sync: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<Time>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_duration: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_mover_status: Option<MoverStatus>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MoverStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
}

impl ReplicationSource {
    pub fn manual_trigger(&self) -> Option<&str> {
        self.spec
            .trigger
            .as_ref()
            .and_then(|t| t.manual.as_deref())
    }

    pub fn last_manual_sync(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.last_manual_sync.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_destination_wire_names() {
        let rd = ReplicationDestination::new(
            "app-data",
            ReplicationDestinationSpec {
                rsync_tls: Some(ReplicationDestinationRsyncTlsSpec {
                    destination_pvc: Some("app-data".to_string()),
                    copy_method: Some(CopyMethod::Direct),
                    ..Default::default()
                }),
                paused: false,
            },
        );
        let value = serde_json::to_value(&rd).unwrap();
        assert_eq!(value["apiVersion"], "volsync.backube/v1alpha1");
        assert_eq!(value["spec"]["rsyncTLS"]["destinationPVC"], "app-data");
        assert_eq!(value["spec"]["rsyncTLS"]["copyMethod"], "Direct");
        assert!(value["spec"].get("paused").is_none());
    }

    #[test]
    fn test_destination_address_requires_non_empty() {
        let mut rd = ReplicationDestination::new("app-data", Default::default());
        assert_eq!(rd.address(), None);

        rd.status = Some(ReplicationDestinationStatus {
            rsync_tls: Some(ReplicationDestinationRsyncTlsStatus {
                address: Some(String::new()),
            }),
            ..Default::default()
        });
        assert_eq!(rd.address(), None);

        rd.status = Some(ReplicationDestinationStatus {
            rsync_tls: Some(ReplicationDestinationRsyncTlsStatus {
                address: Some("10.0.0.7".to_string()),
            }),
            ..Default::default()
        });
        assert_eq!(rd.address(), Some("10.0.0.7"));
    }

    #[test]
    fn test_source_status_parses_mover_fields() {
        let rs: ReplicationSource = serde_json::from_value(json!({
            "apiVersion": "volsync.backube/v1alpha1",
            "kind": "ReplicationSource",
            "metadata": {"name": "app-data", "namespace": "app"},
            "spec": {
                "sourcePVC": "app-data",
                "trigger": {"manual": "vrg-final-sync"}
            },
            "status": {
                "lastManualSync": "vrg-final-sync",
                "lastSyncTime": "2024-05-01T10:00:00Z",
                "lastSyncDuration": "41s",
                "latestMoverStatus": {"result": "Successful"}
            }
        }))
        .unwrap();

        assert_eq!(rs.manual_trigger(), Some("vrg-final-sync"));
        assert_eq!(rs.last_manual_sync(), Some("vrg-final-sync"));
        assert_eq!(rs.spec.source_pvc, "app-data");
        assert_eq!(
            rs.status
                .and_then(|s| s.latest_mover_status)
                .and_then(|m| m.result)
                .as_deref(),
            Some("Successful")
        );
    }
}
