//! Local rollback for direct-copy destinations
//!
//! A direct-copy destination writes into the application claim, so at
//! failover the claim may hold a partially applied transfer. A same-cluster
//! destination/source pair copies the last completed snapshot back into the
//! claim before the application gets it. The local source is triggered with
//! the snapshot's name, which makes completion unambiguous.

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, TypedLocalObjectReference};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use tracing::{debug, info, instrument};

use super::claims::claim_phase;
use super::destination::storage_request;
use super::handler::{Progress, ReplicationHandler, WORKLOAD_STATUS_ACTIVE};
use super::meta::{add_label, CREATED_BY_LABEL, DO_NOT_DELETE_LABEL, TRUE};
use super::naming::{destination_name, local_replication_name, psk_secret_name};
use super::quantity;
use crate::crd::{
    CopyMethod, ProtectedVolume, ReplicationDestination, ReplicationDestinationRsyncTlsSpec,
    ReplicationSource, ReplicationSourceRsyncTlsSpec, ReplicationSourceTriggerSpec,
};
use crate::error::{Error, Result};

/// The local source has copied `snapshot` once its trigger names the snapshot
/// and the mover reports that trigger as executed.
pub fn local_sync_complete(rs: &ReplicationSource, snapshot: &str) -> bool {
    match rs.manual_trigger() {
        Some(trigger) if trigger == snapshot => rs.last_manual_sync() == Some(trigger),
        _ => false,
    }
}

impl ReplicationHandler {
    /// Rolls the application claim back to `snapshot_ref`, the main
    /// destination's latest image.
    #[instrument(skip(self, volume), fields(pvc = %volume.name, snapshot = %snapshot_ref.name))]
    pub async fn rollback_to_last_snapshot(
        &self,
        volume: &ProtectedVolume,
        snapshot_ref: &TypedLocalObjectReference,
    ) -> Result<Progress> {
        let namespace = volume.namespace.as_str();

        // No new inbound transfer may touch the claim from here on.
        let rd = self
            .pause_destination(&destination_name(&volume.name), namespace)
            .await?
            .ok_or_else(|| {
                Error::not_found("ReplicationDestination", format!("{namespace}/{}", volume.name))
            })?;

        let local_name = local_replication_name(&volume.name);
        let local_rd = self.get_destination(&local_name, namespace).await?;
        if local_rd.is_none()
            && self
                .is_claim_in_use_by_pod(&volume.name, namespace, false)
                .await?
        {
            self.set_workload_status(WORKLOAD_STATUS_ACTIVE);
            return Ok(Progress::waiting("claim is still in use by a workload"));
        }

        let psk = psk_secret_name(&self.owner.name);
        let local_rd = self.reconcile_local_destination(volume, &psk).await?;
        let Some(address) = local_rd.address().map(str::to_string) else {
            return Ok(Progress::waiting(format!(
                "local destination {local_name} has no address yet"
            )));
        };

        let local_rs = self
            .reconcile_local_source(&rd, volume, snapshot_ref, &psk, &address)
            .await?;
        if !local_sync_complete(&local_rs, &snapshot_ref.name) {
            return Ok(Progress::waiting(format!(
                "waiting for local source {local_name} to complete its transfer"
            )));
        }

        // Keep a new mover pod from mounting the claim once the copy is done.
        self.pause_destination(&local_name, namespace).await?;

        let status = local_rs.status.as_ref();
        info!(
            last_sync_time = ?status.and_then(|s| s.last_sync_time.as_ref()),
            last_sync_duration = ?status.and_then(|s| s.last_sync_duration.as_deref()),
            "rollback completed"
        );
        Ok(Progress::Done)
    }

    /// Local destination writing straight into the application claim.
    pub(crate) async fn reconcile_local_destination(
        &self,
        volume: &ProtectedVolume,
        psk_secret: &str,
    ) -> Result<ReplicationDestination> {
        self.ensure_claim_for_direct_copy(volume).await?;

        let tls = ReplicationDestinationRsyncTlsSpec {
            service_type: Some(self.config.rsync_service_type.clone()),
            key_secret: Some(psk_secret.to_string()),
            copy_method: Some(CopyMethod::Direct),
            capacity: volume.capacity.clone(),
            storage_class_name: volume.storage_class_name.clone(),
            access_modes: volume.access_modes_or_default(),
            volume_snapshot_class_name: None,
            destination_pvc: Some(volume.name.clone()),
        };

        let (lrd, op) = self
            .client
            .create_or_update::<ReplicationDestination, _>(
                Some(&volume.namespace),
                &local_replication_name(&volume.name),
                |lrd| {
                    self.claim_for_group(&mut lrd.metadata)?;
                    add_label(&mut lrd.metadata, CREATED_BY_LABEL, TRUE);
                    add_label(&mut lrd.metadata, DO_NOT_DELETE_LABEL, TRUE);
                    lrd.spec.rsync_tls = Some(tls);
                    Ok(())
                },
            )
            .await?;

        debug!(lrd = %lrd.name_any(), ?op, "local destination reconciled");
        Ok(lrd)
    }

    /// Local source reading from a read-only claim restored from the snapshot.
    pub(crate) async fn reconcile_local_source(
        &self,
        rd: &ReplicationDestination,
        volume: &ProtectedVolume,
        snapshot_ref: &TypedLocalObjectReference,
        psk_secret: &str,
        address: &str,
    ) -> Result<ReplicationSource> {
        let claim = self.setup_local_source(rd, volume, snapshot_ref).await?;
        let claim_name = claim.name_any();

        let tls = ReplicationSourceRsyncTlsSpec {
            key_secret: Some(psk_secret.to_string()),
            address: Some(address.to_string()),
            copy_method: Some(CopyMethod::Direct),
            ..Default::default()
        };

        let (lrs, op) = self
            .client
            .create_or_update::<ReplicationSource, _>(
                Some(&volume.namespace),
                &local_replication_name(&volume.name),
                |lrs| {
                    self.claim_for_group(&mut lrs.metadata)?;
                    add_label(&mut lrs.metadata, CREATED_BY_LABEL, TRUE);
                    // The claim is named after the snapshot it was restored from.
                    lrs.spec.trigger = Some(ReplicationSourceTriggerSpec::manual(&claim_name));
                    lrs.spec.source_pvc = claim_name.clone();
                    lrs.spec.rsync_tls = Some(tls);
                    Ok(())
                },
            )
            .await?;

        debug!(lrs = %lrs.name_any(), ?op, "local source reconciled");
        Ok(lrs)
    }

    async fn setup_local_source(
        &self,
        rd: &ReplicationDestination,
        volume: &ProtectedVolume,
        snapshot_ref: &TypedLocalObjectReference,
    ) -> Result<PersistentVolumeClaim> {
        let snapshot = self
            .validate_and_protect_snapshot(snapshot_ref, &volume.namespace)
            .await?;
        self.create_claim_from_snapshot(rd, volume, snapshot_ref, snapshot.restore_size())
            .await
    }

    /// Read-only claim the local source copies from.
    async fn create_claim_from_snapshot(
        &self,
        rd: &ReplicationDestination,
        volume: &ProtectedVolume,
        snapshot_ref: &TypedLocalObjectReference,
        restore_size: Option<&Quantity>,
    ) -> Result<PersistentVolumeClaim> {
        let storage_class = self
            .storage_class(volume.storage_class_name.as_deref())
            .await?;

        let requested = rd
            .spec
            .rsync_tls
            .as_ref()
            .and_then(|tls| tls.capacity.as_ref())
            .or(volume.capacity.as_ref());
        let capacity = quantity::larger(requested, restore_size).ok_or_else(|| {
            Error::ValidationError(format!(
                "capacity must be provided for claim {}/{}",
                volume.namespace, volume.name
            ))
        })?;

        let access_modes = if storage_class.provisioner == self.config.read_only_many_driver {
            vec!["ReadOnlyMany".to_string()]
        } else {
            volume.access_modes_or_default()
        };

        let (claim, op) = self
            .client
            .create_or_update::<PersistentVolumeClaim, _>(
                Some(&volume.namespace),
                &snapshot_ref.name,
                |claim| {
                    if claim_phase(claim) == Some("Bound") {
                        return Ok(());
                    }
                    add_label(&mut claim.metadata, CREATED_BY_LABEL, TRUE);

                    let is_new = claim.metadata.creation_timestamp.is_none();
                    let spec = claim.spec.get_or_insert_with(Default::default);
                    if is_new {
                        spec.access_modes = Some(access_modes);
                        spec.storage_class_name = volume.storage_class_name.clone();
                        spec.data_source = Some(snapshot_ref.clone());
                        spec.volume_mode = volume.volume_mode.clone();
                    }
                    spec.resources = Some(storage_request(capacity));
                    Ok(())
                },
            )
            .await?;

        debug!(pvc = %claim.name_any(), ?op, "read-only claim for local source reconciled");
        Ok(claim)
    }

    /// Removes the local pair belonging to the main destination `rd` once the
    /// local source has copied the destination's latest image.
    pub async fn delete_local_replication(&self, rd: &ReplicationDestination) -> Result<Progress> {
        let Some(latest) = rd.latest_image() else {
            return Ok(Progress::Done);
        };
        let namespace = rd.namespace().unwrap_or_default();
        let local_name = local_replication_name(&rd.name_any());

        let Some(lrs) = self
            .client
            .get::<ReplicationSource>(Some(&namespace), &local_name)
            .await?
        else {
            self.delete_local_destination(&local_name, &namespace).await?;
            return Ok(Progress::Done);
        };

        if !local_sync_complete(&lrs, &latest.name) {
            return Ok(Progress::waiting(format!(
                "waiting for local source {local_name} to complete its transfer"
            )));
        }

        self.cleanup_local_resources(&lrs).await?;
        info!(rd = %rd.name_any(), "cleaned up local rollback resources");
        Ok(Progress::Done)
    }

    /// Deletes the snapshot, the read-only claim, the local source and the
    /// local destination, in that order.
    pub(crate) async fn cleanup_local_resources(&self, lrs: &ReplicationSource) -> Result<()> {
        let namespace = lrs.namespace().unwrap_or_default();
        let name = lrs.name_any();

        if let Some(snapshot) = lrs.manual_trigger() {
            self.delete_snapshot(snapshot, &namespace, true).await?;
        }
        if !lrs.spec.source_pvc.is_empty() {
            self.delete_claim(&lrs.spec.source_pvc, &namespace).await?;
        }
        self.client
            .delete::<ReplicationSource>(Some(&namespace), &name)
            .await?;
        self.delete_local_destination(&name, &namespace).await
    }

    pub async fn delete_local_destination(&self, name: &str, namespace: &str) -> Result<()> {
        if self
            .client
            .delete::<ReplicationDestination>(Some(namespace), name)
            .await?
        {
            info!(lrd = name, %namespace, "deleted local destination");
        }
        Ok(())
    }
}
