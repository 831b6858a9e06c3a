//! Outbound replication and the final-sync protocol
//!
//! The protocol state is never stored; [`FinalSyncState::observe`] derives it
//! from the source's trigger and status on every call:
//!
//! ```text
//! Scheduled ──prepare──▶ PreparingFinalSync ──run──▶ FinalSyncRunning ──▶ FinalSyncComplete
//!     └───────────────────────run──────────────────────────▲
//! ```
//!
//! While running, the source reads from a temporary claim bound to the
//! application's volume, so the application claim itself can be deleted.

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info, instrument};

use super::claims::{bound_volume_name, claim_phase};
use super::finalizers::{is_being_deleted, remove_finalizer, CLAIM_PROTECTION_FINALIZER};
use super::handler::{Progress, ReplicationHandler};
use super::meta::{add_annotation, add_label, is_owned_by, remove_annotation, CREATED_BY_LABEL, TRUE};
use super::naming::{
    cron_from_interval, final_sync_claim_name, remote_service_address, source_job_name,
    source_name, DEFAULT_SCHEDULE_CRON, FINAL_SYNC_TRIGGER, PREPARE_FOR_FINAL_SYNC_TRIGGER,
};
use crate::crd::{
    CopyMethod, ProtectedVolume, ReplicationSource, ReplicationSourceRsyncTlsSpec,
    ReplicationSourceTriggerSpec,
};
use crate::error::Result;

/// Annotation that switches the data mover from scheduled snapshots of the
/// claim to snapshots on explicit trigger only
pub const USE_COPY_TRIGGER_ANNOTATION: &str = "volsync.backube/use-copy-trigger";

/// Set by the binder once a claim and volume are bound to each other
pub const BIND_COMPLETED_ANNOTATION: &str = "pv.kubernetes.io/bind-completed";

const CLAIM_LOST_PHASE: &str = "Lost";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinalSyncState {
    Scheduled,
    PreparingFinalSync,
    FinalSyncRunning,
    FinalSyncComplete,
}

impl FinalSyncState {
    pub fn observe(source: Option<&ReplicationSource>) -> Self {
        let Some(rs) = source else {
            return FinalSyncState::Scheduled;
        };
        match rs.manual_trigger() {
            Some(PREPARE_FOR_FINAL_SYNC_TRIGGER) => FinalSyncState::PreparingFinalSync,
            Some(FINAL_SYNC_TRIGGER) if rs.last_manual_sync() == Some(FINAL_SYNC_TRIGGER) => {
                FinalSyncState::FinalSyncComplete
            }
            Some(FINAL_SYNC_TRIGGER) => FinalSyncState::FinalSyncRunning,
            _ => FinalSyncState::Scheduled,
        }
    }
}

/// Verdict of the guard evaluated before every source mutation
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum SetupDecision {
    Proceed,
    Wait(String),
}

fn job_finished(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| (c.type_ == "Complete" || c.type_ == "Failed") && c.status == "True")
        })
}

impl ReplicationHandler {
    pub async fn get_source(&self, name: &str, namespace: &str) -> Result<Option<ReplicationSource>> {
        self.client.get(Some(namespace), name).await
    }

    /// Removes the source for `claim` if this group owns it.
    #[instrument(skip(self))]
    pub async fn delete_source(&self, claim: &str, namespace: &str) -> Result<()> {
        let Some(rs) = self.get_source(&source_name(claim), namespace).await? else {
            return Ok(());
        };
        if !is_owned_by(&rs.metadata, &self.owner) {
            debug!(rs = %rs.name_any(), "source belongs to another group");
            return Ok(());
        }
        self.client
            .delete::<ReplicationSource>(Some(namespace), &rs.name_any())
            .await?;
        info!(rs = %rs.name_any(), "deleted source");
        Ok(())
    }

    /// Whether the source has completed at least one sync.
    pub async fn is_source_data_protected(&self, claim: &str, namespace: &str) -> Result<bool> {
        Ok(self
            .get_source(&source_name(claim), namespace)
            .await?
            .and_then(|rs| rs.status)
            .is_some_and(|s| s.last_sync_time.is_some()))
    }

    fn schedule_cron(&self) -> Result<String> {
        match self.config.scheduling_interval.as_deref() {
            Some(interval) => cron_from_interval(interval),
            None => Ok(DEFAULT_SCHEDULE_CRON.to_string()),
        }
    }

    /// Creates or updates the source. `Ok(None)` means the final-sync guard
    /// asked to wait.
    pub(crate) async fn create_or_update_source(
        &self,
        volume: &ProtectedVolume,
        psk_secret: &str,
        run_final_sync: bool,
    ) -> Result<Option<ReplicationSource>> {
        let storage_class = self
            .storage_class(volume.storage_class_name.as_deref())
            .await?;
        let snapshot_class = self.snapshot_class_for(&storage_class).await?;
        let access_modes = if storage_class.provisioner == self.config.read_only_many_driver {
            vec!["ReadOnlyMany".to_string()]
        } else {
            volume.access_modes.clone()
        };

        if let SetupDecision::Wait(reason) = self.setup_for_final_sync(volume, run_final_sync).await? {
            info!(pvc = %volume.name, %reason, "source update deferred");
            return Ok(None);
        }

        let (source_claim, trigger) = if run_final_sync {
            (
                final_sync_claim_name(&volume.name),
                ReplicationSourceTriggerSpec::manual(FINAL_SYNC_TRIGGER),
            )
        } else {
            (
                volume.name.clone(),
                ReplicationSourceTriggerSpec::scheduled(self.schedule_cron()?),
            )
        };

        let tls = ReplicationSourceRsyncTlsSpec {
            key_secret: Some(psk_secret.to_string()),
            address: Some(remote_service_address(&volume.name, &volume.namespace)),
            copy_method: Some(CopyMethod::Snapshot),
            volume_snapshot_class_name: Some(snapshot_class),
            storage_class_name: volume.storage_class_name.clone(),
            access_modes,
        };

        let (rs, op) = self
            .client
            .create_or_update::<ReplicationSource, _>(
                Some(&volume.namespace),
                &source_name(&volume.name),
                |rs| {
                    if rs.metadata.creation_timestamp.is_none() {
                        add_label(&mut rs.metadata, CREATED_BY_LABEL, TRUE);
                    }
                    self.claim_for_group(&mut rs.metadata)?;
                    rs.spec.source_pvc = source_claim;
                    rs.spec.trigger = Some(trigger);
                    rs.spec.rsync_tls = Some(tls);
                    if run_final_sync {
                        rs.spec.paused = false;
                    }
                    Ok(())
                },
            )
            .await?;

        debug!(rs = %rs.name_any(), ?op, run_final_sync, "source reconciled");
        Ok(Some(rs))
    }

    /// Guard evaluated before the source is written.
    ///
    /// Without a final sync, a recorded prepare trigger parks the source
    /// until the caller confirms with `run_final_sync`. With a final sync the
    /// application claim must already be terminating, and the temporary
    /// claim is brought up before the source is repointed at it.
    pub(crate) async fn setup_for_final_sync(
        &self,
        volume: &ProtectedVolume,
        run_final_sync: bool,
    ) -> Result<SetupDecision> {
        let rs = self
            .get_source(&source_name(&volume.name), &volume.namespace)
            .await?;
        let state = FinalSyncState::observe(rs.as_ref());

        if !run_final_sync {
            if state == FinalSyncState::PreparingFinalSync {
                return Ok(SetupDecision::Wait(
                    "final sync preparation recorded, waiting for confirmation".to_string(),
                ));
            }
            return Ok(SetupDecision::Proceed);
        }

        if matches!(
            state,
            FinalSyncState::FinalSyncRunning | FinalSyncState::FinalSyncComplete
        ) {
            return Ok(SetupDecision::Proceed);
        }

        let Some(claim) = self.get_claim(&volume.name, &volume.namespace).await? else {
            return Ok(SetupDecision::Wait(
                "application claim not found".to_string(),
            ));
        };
        if !is_being_deleted(&claim.metadata) {
            return Ok(SetupDecision::Wait(
                "final sync will not run until the application claim is deleted".to_string(),
            ));
        }

        match self.ensure_final_sync_claim(&claim).await? {
            Progress::Done => Ok(SetupDecision::Proceed),
            Progress::Waiting(reason) => Ok(SetupDecision::Wait(reason)),
        }
    }

    /// Brings up the temporary claim and hands the application's volume to it.
    /// The temporary claim is created before the volume is repointed, so the
    /// volume's claim reference never names a missing claim.
    pub(crate) async fn ensure_final_sync_claim(
        &self,
        original: &PersistentVolumeClaim,
    ) -> Result<Progress> {
        let name = original.name_any();
        let namespace = original.namespace().unwrap_or_default();
        let tmp_name = final_sync_claim_name(&name);

        let Some(volume_name) = bound_volume_name(original).map(str::to_string) else {
            return Ok(Progress::waiting(format!(
                "claim {namespace}/{name} is not bound to a volume"
            )));
        };

        match self.get_claim(&tmp_name, &namespace).await? {
            None => {
                let mut tmp = PersistentVolumeClaim {
                    metadata: ObjectMeta {
                        name: Some(tmp_name.clone()),
                        namespace: Some(namespace.clone()),
                        ..Default::default()
                    },
                    spec: original.spec.clone(),
                    status: None,
                };
                self.claim_for_group(&mut tmp.metadata)?;
                self.client.create(&tmp).await?;
                self.retain_volume(&volume_name, &tmp_name, &namespace).await?;
                info!(pvc = %tmp_name, volume = %volume_name, "created temporary claim for final sync");
                Ok(Progress::waiting("temporary claim created, waiting for it to bind"))
            }
            Some(tmp) => {
                self.retain_volume(&volume_name, &tmp_name, &namespace).await?;
                if claim_phase(&tmp) == Some(CLAIM_LOST_PHASE) {
                    let mut rebind = tmp.clone();
                    if remove_annotation(&mut rebind.metadata, BIND_COMPLETED_ANNOTATION) {
                        self.client.update(&rebind).await?;
                    }
                    info!(pvc = %tmp_name, "temporary claim lost its volume, cleared binding");
                    return Ok(Progress::waiting("temporary claim is rebinding"));
                }
                Ok(Progress::Done)
            }
        }
    }

    /// Hands the volume back to the original claim and removes the temporary one.
    #[instrument(skip(self))]
    pub async fn undo_after_final_sync(&self, claim: &str, namespace: &str) -> Result<()> {
        let tmp_name = final_sync_claim_name(claim);

        if let Some(original) = self.get_claim(claim, namespace).await? {
            if let Some(volume_name) = bound_volume_name(&original) {
                self.unretain_volume(volume_name, claim, namespace).await?;
            }
            self.delete_claim(&tmp_name, namespace).await?;

            let mut released = original.clone();
            if remove_finalizer(&mut released.metadata, CLAIM_PROTECTION_FINALIZER) {
                self.client.update(&released).await?;
                debug!(pvc = claim, "removed protection finalizer");
            }
        } else {
            self.delete_claim(&tmp_name, namespace).await?;
        }
        Ok(())
    }

    pub(crate) async fn finish_final_sync(&self, volume: &ProtectedVolume) -> Result<()> {
        self.undo_after_final_sync(&volume.name, &volume.namespace)
            .await?;
        if !self.is_copy_method_direct() {
            self.delete_claim(&volume.name, &volume.namespace).await?;
        }
        info!(pvc = %volume.name, "final sync complete");
        Ok(())
    }

    /// Whether the data mover still runs a transfer job for `claim`.
    pub async fn is_active_job_present(&self, claim: &str, namespace: &str) -> Result<bool> {
        Ok(self
            .client
            .get::<Job>(Some(namespace), &source_job_name(claim))
            .await?
            .is_some_and(|job| !job_finished(&job)))
    }

    async fn stop_claim_snapshotting(&self, claim: &str, namespace: &str) -> Result<()> {
        let Some(existing) = self.get_claim(claim, namespace).await? else {
            return Ok(());
        };
        let mut updated = existing.clone();
        add_annotation(&mut updated.metadata, USE_COPY_TRIGGER_ANNOTATION, TRUE);
        self.client.update_if_changed(&existing, &updated).await?;
        Ok(())
    }

    /// Parks a scheduled source on the prepare trigger.
    pub async fn stop_scheduling_source(&self, claim: &str, namespace: &str) -> Result<()> {
        let Some(rs) = self.get_source(&source_name(claim), namespace).await? else {
            return Ok(());
        };
        if FinalSyncState::observe(Some(&rs)) != FinalSyncState::Scheduled {
            return Ok(());
        }
        let mut parked = rs;
        parked.spec.trigger = Some(ReplicationSourceTriggerSpec::manual(
            PREPARE_FOR_FINAL_SYNC_TRIGGER,
        ));
        self.client.update(&parked).await?;
        info!(rs = %source_name(claim), "source scheduling stopped for final sync");
        Ok(())
    }

    /// Stops replication of `claim` and returns it to the application so the
    /// application can be removed.
    #[instrument(skip(self))]
    pub async fn prepare_for_final_sync(&self, claim: &str, namespace: &str) -> Result<Progress> {
        if self.is_active_job_present(claim, namespace).await? {
            return Ok(Progress::waiting("waiting for the running transfer job to finish"));
        }
        self.stop_claim_snapshotting(claim, namespace).await?;
        self.stop_scheduling_source(claim, namespace).await?;
        self.release_ownership(claim, namespace).await?;
        Ok(Progress::Done)
    }
}
