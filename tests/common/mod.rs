//! Shared fixtures: a cluster with one storage class, one matching snapshot
//! class, the group's key secret and a bound application claim.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{
    ObjectReference, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimStatus, PersistentVolumeSpec, Secret,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::json;
use volsync_dr::config::EngineConfig;
use volsync_dr::controller::ReplicationHandler;
use volsync_dr::crd::{
    CopyMethod, GroupOwner, ProtectedVolume, ReplicationDestination, ReplicationSource,
    VolumeSnapshot, VolumeSnapshotClass, VolumeSnapshotSource, VolumeSnapshotSpec,
    VolumeSnapshotStatus,
};
use volsync_dr::store::{ClusterClient, MemoryStore};

pub const NS: &str = "app";
pub const CLAIM: &str = "app-data";
pub const VOLUME: &str = "pv-app-data";
pub const GROUP: &str = "vrg-app";
pub const GROUP_UID: &str = "6f1c2a94-0000-4000-8000-00000000a001";
pub const PROVISIONER: &str = "rbd.csi.ceph.com";

/// Finalizer the platform places on every claim; keeps a deleted claim
/// around the way a mounted claim would be.
pub const PVC_PROTECTION_FINALIZER: &str = "kubernetes.io/pvc-protection";

pub fn meta(name: &str, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        ..Default::default()
    }
}

pub fn owner() -> GroupOwner {
    GroupOwner::new(GROUP, NS, GROUP_UID)
}

pub fn cluster() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store
        .insert(&StorageClass {
            metadata: meta("rbd", None),
            provisioner: PROVISIONER.to_string(),
            ..Default::default()
        })
        .unwrap();
    store
        .insert(&VolumeSnapshotClass {
            metadata: meta("rbd-snapclass", None),
            driver: PROVISIONER.to_string(),
            deletion_policy: "Delete".to_string(),
            ..Default::default()
        })
        .unwrap();
    store
        .insert(&Secret {
            metadata: meta("vrg-app-vs-secret", Some(NS)),
            string_data: Some(BTreeMap::from([("psk.txt".to_string(), "k".to_string())])),
            ..Default::default()
        })
        .unwrap();
    store
}

/// Seeds the application claim bound to its volume.
pub fn with_application_claim(store: &MemoryStore, finalizers: &[&str]) {
    let mut claim = PersistentVolumeClaim {
        metadata: meta(CLAIM, Some(NS)),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: Some("rbd".to_string()),
            volume_name: Some(VOLUME.to_string()),
            ..Default::default()
        }),
        status: Some(PersistentVolumeClaimStatus {
            phase: Some("Bound".to_string()),
            ..Default::default()
        }),
    };
    if !finalizers.is_empty() {
        claim.metadata.finalizers = Some(finalizers.iter().map(|f| f.to_string()).collect());
    }
    store.insert(&claim).unwrap();

    store
        .insert(&PersistentVolume {
            metadata: meta(VOLUME, None),
            spec: Some(PersistentVolumeSpec {
                persistent_volume_reclaim_policy: Some("Delete".to_string()),
                claim_ref: Some(ObjectReference {
                    api_version: Some("v1".to_string()),
                    kind: Some("PersistentVolumeClaim".to_string()),
                    name: Some(CLAIM.to_string()),
                    namespace: Some(NS.to_string()),
                    uid: Some("claim-uid-1".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: None,
        })
        .unwrap();
}

pub fn engine(copy_method: CopyMethod) -> EngineConfig {
    EngineConfig {
        destination_copy_method: copy_method,
        ..Default::default()
    }
}

pub fn handler(store: &Arc<MemoryStore>, config: EngineConfig) -> ReplicationHandler {
    ReplicationHandler::new(ClusterClient::new(store.clone()), owner(), config)
}

pub fn client(store: &Arc<MemoryStore>) -> ClusterClient {
    ClusterClient::new(store.clone())
}

pub fn protected_volume() -> ProtectedVolume {
    ProtectedVolume {
        name: CLAIM.to_string(),
        namespace: NS.to_string(),
        protected_by_volsync: true,
        storage_class_name: Some("rbd".to_string()),
        access_modes: vec!["ReadWriteOnce".to_string()],
        capacity: Some(Quantity("1Gi".to_string())),
        ..Default::default()
    }
}

pub fn snapshot(name: &str, restore_size: &str) -> VolumeSnapshot {
    let mut snapshot = VolumeSnapshot::new(
        name,
        VolumeSnapshotSpec {
            source: VolumeSnapshotSource {
                persistent_volume_claim_name: Some("volsync-app-data-dst".to_string()),
                ..Default::default()
            },
            volume_snapshot_class_name: Some("rbd-snapclass".to_string()),
        },
    );
    snapshot.metadata.namespace = Some(NS.to_string());
    snapshot.status = Some(VolumeSnapshotStatus {
        ready_to_use: Some(true),
        restore_size: Some(Quantity(restore_size.to_string())),
        ..Default::default()
    });
    snapshot
}

/// Plays the data mover: assigns the destination an address and, when
/// given, a latest image.
pub fn destination_synced(store: &MemoryStore, name: &str, address: &str, image: Option<&str>) {
    let mut status = json!({ "rsyncTLS": { "address": address } });
    if let Some(image) = image {
        status["latestImage"] = json!({
            "apiGroup": "snapshot.storage.k8s.io",
            "kind": "VolumeSnapshot",
            "name": image,
        });
    }
    store
        .set_status::<ReplicationDestination>(Some(NS), name, status)
        .unwrap();
}

/// Plays the data mover: records `trigger` as the last executed manual sync.
pub fn source_synced(store: &MemoryStore, name: &str, trigger: &str) {
    store
        .set_status::<ReplicationSource>(
            Some(NS),
            name,
            json!({
                "lastManualSync": trigger,
                "lastSyncTime": "2026-10-19T08:00:00Z",
                "lastSyncDuration": "42s",
            }),
        )
        .unwrap();
}
