//! Inbound replication
//!
//! Destinations, their cross-cluster service exports, claims restored from
//! replicated snapshots and retention of the snapshots themselves.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, TypedLocalObjectReference,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use super::claims::claim_phase;
use super::finalizers::{remove_finalizer, CLAIM_PROTECTION_FINALIZER};
use super::handler::{Progress, ReplicationHandler};
use super::meta::{
    add_annotation, add_label, add_owner_labels, add_owner_reference, has_label, is_owned_by,
    remove_annotation, CREATED_BY_LABEL, DO_NOT_DELETE_LABEL, PLATFORM_ANNOTATION_PREFIX, TRUE,
};
use super::naming::{destination_name, local_service_name};
use super::quantity;
use crate::config::SnapshotPrunePolicy;
use crate::crd::{
    CopyMethod, ProtectedVolume, ReplicationDestination, ReplicationDestinationRsyncTlsSpec,
    VolumeSnapshot, SNAPSHOT_GROUP, VOLUME_SNAPSHOT_KIND,
};
use crate::error::{Error, Result};

const SERVICE_EXPORT_GROUP: &str = "multicluster.x-k8s.io";
const SERVICE_EXPORT_VERSION: &str = "v1alpha1";
const SERVICE_EXPORT_KIND: &str = "ServiceExport";

/// How the destination receives data for a volume
pub(crate) enum DestinationClaim {
    /// Into a scratch volume owned by the data mover
    Snapshot,
    /// Straight into the named application claim
    Direct(String),
    /// Direct copy is blocked because a workload still uses the claim
    InUse,
}

fn service_export_resource() -> ApiResource {
    ApiResource {
        group: SERVICE_EXPORT_GROUP.to_string(),
        version: SERVICE_EXPORT_VERSION.to_string(),
        api_version: format!("{SERVICE_EXPORT_GROUP}/{SERVICE_EXPORT_VERSION}"),
        kind: SERVICE_EXPORT_KIND.to_string(),
        plural: "serviceexports".to_string(),
    }
}

/// A latest image is usable only when it names a snapshot.
pub fn is_snapshot_reference(reference: &TypedLocalObjectReference) -> bool {
    reference.kind == VOLUME_SNAPSHOT_KIND && !reference.name.is_empty()
}

pub(crate) fn with_snapshot_group(reference: &TypedLocalObjectReference) -> TypedLocalObjectReference {
    let mut reference = reference.clone();
    if reference.api_group.as_deref().unwrap_or("").is_empty() {
        reference.api_group = Some(SNAPSHOT_GROUP.to_string());
    }
    reference
}

fn same_data_source(
    existing: Option<&TypedLocalObjectReference>,
    wanted: &TypedLocalObjectReference,
) -> bool {
    existing.is_some_and(|ds| {
        ds.kind == wanted.kind
            && ds.name == wanted.name
            && ds.api_group.as_deref().unwrap_or(SNAPSHOT_GROUP)
                == wanted.api_group.as_deref().unwrap_or(SNAPSHOT_GROUP)
    })
}

pub(crate) fn storage_request(capacity: Quantity) -> VolumeResourceRequirements {
    VolumeResourceRequirements {
        requests: Some(BTreeMap::from([("storage".to_string(), capacity)])),
        ..Default::default()
    }
}

impl ReplicationHandler {
    pub async fn get_destination(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ReplicationDestination>> {
        self.client.get(Some(namespace), name).await
    }

    pub(crate) async fn prepare_destination_claim(
        &self,
        volume: &ProtectedVolume,
    ) -> Result<DestinationClaim> {
        if !self.is_copy_method_direct() {
            return Ok(DestinationClaim::Snapshot);
        }
        if self
            .is_claim_in_use_by_non_destination_pod(&volume.name, &volume.namespace)
            .await?
        {
            return Ok(DestinationClaim::InUse);
        }
        self.ensure_claim_for_direct_copy(volume).await?;
        Ok(DestinationClaim::Direct(volume.name.clone()))
    }

    /// A claim feeding an existing destination is the mover's, not the workload's.
    pub async fn is_claim_in_use_by_non_destination_pod(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<bool> {
        if self
            .get_destination(&destination_name(name), namespace)
            .await?
            .is_some()
        {
            return Ok(false);
        }
        self.claim_exists_and_in_use(name, namespace, false).await
    }

    /// Creates the application claim a direct-copy destination writes into,
    /// or hands an existing one over from the application.
    #[instrument(skip(self, volume), fields(pvc = %volume.name, namespace = %volume.namespace))]
    pub async fn ensure_claim_for_direct_copy(&self, volume: &ProtectedVolume) -> Result<()> {
        if volume.access_modes.is_empty() {
            return Err(Error::ValidationError(format!(
                "accessModes must be provided for claim {}/{}",
                volume.namespace, volume.name
            )));
        }
        let capacity = volume.capacity.clone().ok_or_else(|| {
            Error::ValidationError(format!(
                "capacity must be provided for claim {}/{}",
                volume.namespace, volume.name
            ))
        })?;

        if let Some(existing) = self.get_claim(&volume.name, &volume.namespace).await? {
            let mut updated = existing.clone();
            remove_finalizer(&mut updated.metadata, CLAIM_PROTECTION_FINALIZER);
            let platform_keys: Vec<String> = updated
                .annotations()
                .keys()
                .filter(|k| k.starts_with(PLATFORM_ANNOTATION_PREFIX))
                .cloned()
                .collect();
            for key in platform_keys {
                remove_annotation(&mut updated.metadata, &key);
            }
            if self.client.update_if_changed(&existing, &updated).await? {
                debug!("released existing claim for direct copy");
            }
            return Ok(());
        }

        let mut labels = volume.labels.clone();
        labels.insert(CREATED_BY_LABEL.to_string(), TRUE.to_string());
        let claim = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(volume.name.clone()),
                namespace: Some(volume.namespace.clone()),
                labels: Some(labels),
                annotations: (!volume.annotations.is_empty()).then(|| volume.annotations.clone()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(volume.access_modes.clone()),
                storage_class_name: volume.storage_class_name.clone(),
                resources: Some(storage_request(capacity)),
                volume_mode: volume.volume_mode.clone(),
                ..Default::default()
            }),
            status: None,
        };
        self.client.create(&claim).await?;
        info!("created claim for direct copy");
        Ok(())
    }

    pub(crate) async fn create_or_update_destination(
        &self,
        volume: &ProtectedVolume,
        psk_secret: &str,
        destination_claim: Option<&str>,
    ) -> Result<ReplicationDestination> {
        let storage_class = self
            .storage_class(volume.storage_class_name.as_deref())
            .await?;
        let snapshot_class = self.snapshot_class_for(&storage_class).await?;

        let capacity = match destination_claim {
            Some(_) => None,
            None => Some(volume.capacity.clone().ok_or_else(|| {
                Error::ValidationError(format!(
                    "capacity must be provided for claim {}/{}",
                    volume.namespace, volume.name
                ))
            })?),
        };

        let tls = ReplicationDestinationRsyncTlsSpec {
            service_type: Some(self.config.rsync_service_type.clone()),
            key_secret: Some(psk_secret.to_string()),
            copy_method: Some(CopyMethod::Snapshot),
            capacity,
            storage_class_name: volume.storage_class_name.clone(),
            access_modes: volume.access_modes.clone(),
            volume_snapshot_class_name: Some(snapshot_class),
            destination_pvc: destination_claim.map(str::to_string),
        };

        let (rd, op) = self
            .client
            .create_or_update::<ReplicationDestination, _>(
                Some(&volume.namespace),
                &destination_name(&volume.name),
                |rd| {
                    if rd.metadata.creation_timestamp.is_none() {
                        add_label(&mut rd.metadata, CREATED_BY_LABEL, TRUE);
                    }
                    self.claim_for_group(&mut rd.metadata)?;
                    rd.spec.rsync_tls = Some(tls);
                    Ok(())
                },
            )
            .await?;

        debug!(rd = %rd.name_any(), ?op, "destination reconciled");
        Ok(rd)
    }

    /// Exports the destination's service to the cluster set. The export is
    /// owned by the destination so both go away together.
    pub(crate) async fn ensure_service_export(&self, rd: &ReplicationDestination) -> Result<()> {
        let resource = service_export_resource();
        let name = local_service_name(&rd.name_any());
        let namespace = rd.namespace().unwrap_or_default();
        let owner = OwnerReference {
            api_version: ReplicationDestination::api_version(&()).into_owned(),
            kind: ReplicationDestination::kind(&()).into_owned(),
            name: rd.name_any(),
            uid: rd.uid().unwrap_or_default(),
            ..Default::default()
        };

        let store = self.client.store();
        match store.get(&resource, Some(&namespace), &name).await? {
            Some(mut export) => {
                if add_owner_reference(&mut export.metadata, owner) {
                    store.replace(&resource, &export).await?;
                    debug!(export = %name, "service export owner updated");
                }
            }
            None => {
                let mut export = DynamicObject::new(&name, &resource).within(&namespace);
                export.metadata.owner_references = Some(vec![owner]);
                store.create(&resource, &export).await?;
                info!(export = %name, %namespace, "created service export");
            }
        }
        Ok(())
    }

    /// Deletes all but the newest group-owned snapshot in `namespace`.
    #[instrument(skip(self))]
    pub async fn prune_old_snapshots(&self, namespace: &str) -> Result<()> {
        let mut snapshots: Vec<VolumeSnapshot> = self.list_owned(Some(namespace)).await?;
        if snapshots.len() <= 1 {
            return Ok(());
        }

        snapshots.sort_by_key(|s| s.metadata.creation_timestamp.as_ref().map(|t| t.0));
        snapshots.pop();

        for snapshot in snapshots {
            if self.config.snapshot_prune_policy == SnapshotPrunePolicy::SkipProtected
                && has_label(&snapshot.metadata, DO_NOT_DELETE_LABEL, TRUE)
            {
                debug!(snapshot = %snapshot.name_any(), "keeping protected snapshot");
                continue;
            }
            self.client
                .delete::<VolumeSnapshot>(Some(namespace), &snapshot.name_any())
                .await?;
            info!(snapshot = %snapshot.name_any(), "pruned superseded snapshot");
        }
        Ok(())
    }

    /// Deletes every group-owned snapshot in `namespace`.
    pub async fn delete_snapshots(&self, namespace: &str) -> Result<()> {
        let snapshots: Vec<VolumeSnapshot> = self.list_owned(Some(namespace)).await?;
        for snapshot in snapshots {
            self.delete_snapshot(&snapshot.name_any(), namespace, true)
                .await?;
        }
        Ok(())
    }

    /// Unless `force` is set a do-not-delete snapshot is left alone.
    pub async fn delete_snapshot(&self, name: &str, namespace: &str, force: bool) -> Result<()> {
        let Some(snapshot) = self
            .client
            .get::<VolumeSnapshot>(Some(namespace), name)
            .await?
        else {
            return Ok(());
        };
        if !force && has_label(&snapshot.metadata, DO_NOT_DELETE_LABEL, TRUE) {
            debug!(snapshot = name, "snapshot is protected, not deleting");
            return Ok(());
        }
        self.client
            .delete::<VolumeSnapshot>(Some(namespace), name)
            .await?;
        info!(snapshot = name, %namespace, "deleted snapshot");
        Ok(())
    }

    /// Removes the destination for `claim`. In direct mode the local
    /// rollback pair must be gone first.
    #[instrument(skip(self))]
    pub async fn delete_destination(&self, claim: &str, namespace: &str) -> Result<Progress> {
        let Some(rd) = self
            .get_destination(&destination_name(claim), namespace)
            .await?
        else {
            return Ok(Progress::Done);
        };
        if !is_owned_by(&rd.metadata, &self.owner) {
            debug!(rd = %rd.name_any(), "destination belongs to another group");
            return Ok(Progress::Done);
        }

        if self.is_copy_method_direct() {
            if let Progress::Waiting(reason) = self.delete_local_replication(&rd).await? {
                return Ok(Progress::Waiting(reason));
            }
        }

        self.client
            .delete::<ReplicationDestination>(Some(namespace), &rd.name_any())
            .await?;
        info!(rd = %rd.name_any(), "deleted destination");
        Ok(Progress::Done)
    }

    pub async fn pause_destination(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ReplicationDestination>> {
        let Some(rd) = self.get_destination(name, namespace).await? else {
            return Ok(None);
        };
        if rd.spec.paused {
            return Ok(Some(rd));
        }
        let mut paused = rd;
        paused.spec.paused = true;
        let paused = self.client.update(&paused).await?;
        info!(rd = name, "paused destination");
        Ok(Some(paused))
    }

    pub async fn latest_image(
        &self,
        claim: &str,
        namespace: &str,
    ) -> Result<Option<TypedLocalObjectReference>> {
        Ok(self
            .get_destination(&destination_name(claim), namespace)
            .await?
            .and_then(|rd| rd.latest_image().cloned()))
    }

    /// Whether the destination has produced at least one usable snapshot.
    pub async fn is_destination_data_protected(&self, claim: &str, namespace: &str) -> Result<bool> {
        Ok(self
            .latest_image(claim, namespace)
            .await?
            .as_ref()
            .is_some_and(is_snapshot_reference))
    }

    pub(crate) async fn latest_snapshot_reference(
        &self,
        volume: &ProtectedVolume,
    ) -> Result<TypedLocalObjectReference> {
        let latest = self
            .latest_image(&volume.name, &volume.namespace)
            .await?
            .filter(is_snapshot_reference)
            .ok_or_else(|| {
                Error::not_found(
                    "latest image of ReplicationDestination",
                    format!("{}/{}", volume.namespace, volume.name),
                )
            })?;
        Ok(with_snapshot_group(&latest))
    }

    /// Labels the snapshot as in use by the group so neither the data mover
    /// nor generic sweeps delete it.
    pub async fn validate_and_protect_snapshot(
        &self,
        reference: &TypedLocalObjectReference,
        namespace: &str,
    ) -> Result<VolumeSnapshot> {
        let snapshot = self
            .client
            .get::<VolumeSnapshot>(Some(namespace), &reference.name)
            .await?
            .ok_or_else(|| {
                Error::not_found("VolumeSnapshot", format!("{namespace}/{}", reference.name))
            })?;

        let mut protected = snapshot.clone();
        add_owner_labels(&mut protected.metadata, &self.owner);
        add_label(&mut protected.metadata, DO_NOT_DELETE_LABEL, TRUE);
        if self.owner_references_allowed() {
            add_owner_reference(&mut protected.metadata, self.owner.owner_reference(false));
        }

        if self.client.update_if_changed(&snapshot, &protected).await? {
            debug!(snapshot = %reference.name, "protected snapshot");
            return Ok(protected);
        }
        Ok(snapshot)
    }

    /// Creates the application claim from a snapshot. Data sources are
    /// immutable, so a claim restored from another snapshot is deleted and
    /// the caller retries.
    #[instrument(skip(self, volume, restore_size), fields(pvc = %volume.name, snapshot = %snapshot.name))]
    pub async fn ensure_claim_from_snapshot(
        &self,
        volume: &ProtectedVolume,
        snapshot: &TypedLocalObjectReference,
        restore_size: Option<&Quantity>,
    ) -> Result<PersistentVolumeClaim> {
        let capacity = quantity::larger(volume.capacity.as_ref(), restore_size).ok_or_else(|| {
            Error::ValidationError(format!(
                "capacity must be provided for claim {}/{}",
                volume.namespace, volume.name
            ))
        })?;

        let mut wrong_source = false;
        let (claim, op) = self
            .client
            .create_or_update::<PersistentVolumeClaim, _>(
                Some(&volume.namespace),
                &volume.name,
                |claim| {
                    let is_new = claim.metadata.creation_timestamp.is_none();
                    if !is_new {
                        let current = claim.spec.as_ref().and_then(|s| s.data_source.as_ref());
                        if !same_data_source(current, snapshot) {
                            wrong_source = true;
                            return Ok(());
                        }
                    }
                    if claim_phase(claim) == Some("Bound") {
                        return Ok(());
                    }

                    if is_new {
                        add_label(&mut claim.metadata, CREATED_BY_LABEL, TRUE);
                    }
                    for (k, v) in &volume.labels {
                        add_label(&mut claim.metadata, k, v);
                    }
                    for (k, v) in &volume.annotations {
                        add_annotation(&mut claim.metadata, k, v);
                    }

                    let spec = claim.spec.get_or_insert_with(Default::default);
                    if is_new {
                        spec.access_modes = Some(volume.access_modes_or_default());
                        spec.storage_class_name = volume.storage_class_name.clone();
                        spec.data_source = Some(snapshot.clone());
                        spec.volume_mode = volume.volume_mode.clone();
                    }
                    spec.resources = Some(storage_request(capacity));
                    Ok(())
                },
            )
            .await?;

        if wrong_source {
            warn!("claim restored from a different snapshot, recreating");
            self.delete_claim(&volume.name, &volume.namespace).await?;
            return Err(Error::Requeue(format!(
                "claim {}/{} has an incorrect data source, deleted for recreation",
                volume.namespace, volume.name
            )));
        }

        debug!(?op, "restored claim reconciled");
        Ok(claim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(kind: &str, name: &str, group: Option<&str>) -> TypedLocalObjectReference {
        TypedLocalObjectReference {
            api_group: group.map(str::to_string),
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    #[test]
    fn test_snapshot_reference_check() {
        assert!(is_snapshot_reference(&reference("VolumeSnapshot", "snap-1", None)));
        assert!(!is_snapshot_reference(&reference("VolumeSnapshot", "", None)));
        assert!(!is_snapshot_reference(&reference(
            "PersistentVolumeClaim",
            "app-data",
            None
        )));
    }

    #[test]
    fn test_snapshot_group_filled_in() {
        let filled = with_snapshot_group(&reference("VolumeSnapshot", "snap-1", Some("")));
        assert_eq!(filled.api_group.as_deref(), Some(SNAPSHOT_GROUP));
    }

    #[test]
    fn test_same_data_source_defaults_group() {
        let wanted = reference("VolumeSnapshot", "snap-1", Some(SNAPSHOT_GROUP));
        assert!(same_data_source(
            Some(&reference("VolumeSnapshot", "snap-1", None)),
            &wanted
        ));
        assert!(!same_data_source(
            Some(&reference("VolumeSnapshot", "snap-0", None)),
            &wanted
        ));
        assert!(!same_data_source(None, &wanted));
    }
}
