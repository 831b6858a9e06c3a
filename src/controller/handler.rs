//! Orchestration façade
//!
//! [`ReplicationHandler`] is built once per replication group per reconcile
//! and called once per protected volume. Its entry points sequence the
//! destination, source, ownership and rollback steps and translate unmet
//! preconditions into "retry later" results instead of errors.

use std::sync::{Mutex, PoisonError};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use super::destination::DestinationClaim;
use super::meta::{
    add_owner_annotations, add_owner_labels, has_label, owner_labels, set_controller_reference,
    DO_NOT_DELETE_LABEL, TRUE,
};
use super::naming::{destination_name, psk_secret_name, source_name};
use super::source::FinalSyncState;
use crate::config::EngineConfig;
use crate::crd::{
    GroupOwner, ProtectedVolume, ReplicationDestination, ReplicationSource, ReplicationState,
    VolumeSnapshotClass,
};
use crate::error::{Error, Result};
use crate::store::{ClusterClient, Object, Selector};

/// Workload status reported when a transition is blocked by a live consumer
pub const WORKLOAD_STATUS_ACTIVE: &str = "active";

/// Outcome of a step that may have to wait for the cluster to catch up
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Progress {
    Done,
    /// Precondition not met yet; retry after a backoff
    Waiting(String),
}

impl Progress {
    pub fn waiting(reason: impl Into<String>) -> Self {
        Progress::Waiting(reason.into())
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Progress::Done)
    }
}

/// Result of reconciling the sending side of a volume
#[derive(Clone, Debug, Default)]
pub struct SourceOutcome {
    pub final_sync_complete: bool,
    /// `None` asks the caller to retry
    pub source: Option<ReplicationSource>,
}

pub struct ReplicationHandler {
    pub(crate) client: ClusterClient,
    pub(crate) owner: GroupOwner,
    pub(crate) config: EngineConfig,
    pub(crate) snapshot_classes: OnceCell<Vec<VolumeSnapshotClass>>,
    workload_status: Mutex<Option<String>>,
}

impl ReplicationHandler {
    pub fn new(client: ClusterClient, owner: GroupOwner, config: EngineConfig) -> Self {
        Self {
            client,
            owner,
            config,
            snapshot_classes: OnceCell::new(),
            workload_status: Mutex::new(None),
        }
    }

    pub fn owner(&self) -> &GroupOwner {
        &self.owner
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_copy_method_direct(&self) -> bool {
        self.config.is_copy_method_direct()
    }

    /// Set when a transition was blocked because the workload still uses a claim.
    pub fn workload_status(&self) -> Option<String> {
        self.workload_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_workload_status(&self, status: &str) {
        *self
            .workload_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(status.to_string());
    }

    /// Owner references cannot point across namespaces, so they are only
    /// placed when the group shares the application's namespace.
    pub(crate) fn owner_references_allowed(&self) -> bool {
        !self.config.admin_namespace
    }

    /// Marks `meta` as created and managed by this group.
    pub(crate) fn claim_for_group(&self, meta: &mut ObjectMeta) -> Result<()> {
        if self.owner_references_allowed() {
            set_controller_reference(meta, self.owner.owner_reference(true))?;
        } else {
            add_owner_annotations(meta, &self.owner);
        }
        add_owner_labels(meta, &self.owner);
        Ok(())
    }

    /// Objects of kind `K` carrying this group's owner labels.
    pub(crate) async fn list_owned<K: Object>(&self, namespace: Option<&str>) -> Result<Vec<K>> {
        self.client
            .list(namespace, &Selector::from_labels(owner_labels(&self.owner)))
            .await
    }

    // ─── Façade ─────────────────────────────────────────────────────────────

    /// Maintains the receiving endpoint of `volume`. `Ok(None)` means the
    /// destination is not ready yet (no address assigned, secret missing, or
    /// the direct-copy claim still in use) and the caller should retry.
    #[instrument(skip(self, volume), fields(pvc = %volume.name, namespace = %volume.namespace))]
    pub async fn reconcile_destination(
        &self,
        volume: &ProtectedVolume,
    ) -> Result<Option<ReplicationDestination>> {
        volume.validate()?;

        let psk = psk_secret_name(&self.owner.name);
        if !self.ensure_secret(&psk).await? {
            return Ok(None);
        }
        if self.config.admin_namespace {
            self.copy_secret_to_namespace(&psk, &volume.namespace).await?;
        }

        // Role exclusivity: a volume is never both sent and received here.
        self.delete_source(&volume.name, &volume.namespace).await?;

        let destination_claim = match self.prepare_destination_claim(volume).await? {
            DestinationClaim::InUse => {
                self.set_workload_status(WORKLOAD_STATUS_ACTIVE);
                info!("claim is in use by a workload, not creating destination");
                return Ok(None);
            }
            DestinationClaim::Direct(name) => Some(name),
            DestinationClaim::Snapshot => None,
        };

        let rd = self
            .create_or_update_destination(volume, &psk, destination_claim.as_deref())
            .await?;
        self.ensure_service_export(&rd).await?;

        if rd.address().is_none() {
            debug!(rd = %rd.name_any(), "destination has no address yet");
            return Ok(None);
        }

        self.prune_old_snapshots(&volume.namespace).await?;

        info!(rd = %rd.name_any(), address = rd.address().unwrap_or_default(), "destination ready");
        Ok(Some(rd))
    }

    /// Maintains the sending endpoint of `volume` and, when `run_final_sync`
    /// is set, drives the final synchronization to completion.
    #[instrument(skip(self, volume), fields(pvc = %volume.name, namespace = %volume.namespace))]
    pub async fn reconcile_source(
        &self,
        volume: &ProtectedVolume,
        run_final_sync: bool,
    ) -> Result<SourceOutcome> {
        volume.validate()?;
        let (name, namespace) = (volume.name.as_str(), volume.namespace.as_str());

        let psk = psk_secret_name(&self.owner.name);
        if !self.ensure_secret(&psk).await? {
            return Ok(SourceOutcome::default());
        }
        if self.config.admin_namespace {
            self.copy_secret_to_namespace(&psk, namespace).await?;
        }

        let existing = self.get_source(&source_name(name), namespace).await?;

        if let Progress::Waiting(reason) = self.delete_destination(name, namespace).await? {
            info!(%reason, "waiting for the destination to be removed");
            return Ok(SourceOutcome {
                final_sync_complete: false,
                source: existing,
            });
        }

        if run_final_sync {
            match FinalSyncState::observe(existing.as_ref()) {
                FinalSyncState::FinalSyncComplete => {
                    self.finish_final_sync(volume).await?;
                    return Ok(SourceOutcome {
                        final_sync_complete: true,
                        source: existing,
                    });
                }
                FinalSyncState::Scheduled | FinalSyncState::PreparingFinalSync => {
                    if self.claim_exists_and_in_use(name, namespace, false).await? {
                        self.set_workload_status(WORKLOAD_STATUS_ACTIVE);
                        info!("claim is still in use, final sync deferred");
                        return Ok(SourceOutcome {
                            final_sync_complete: false,
                            source: existing,
                        });
                    }
                }
                FinalSyncState::FinalSyncRunning => {}
            }
        }

        let Some(rs) = self
            .create_or_update_source(volume, &psk, run_final_sync)
            .await?
        else {
            return Ok(SourceOutcome {
                final_sync_complete: false,
                source: existing,
            });
        };

        if run_final_sync && FinalSyncState::observe(Some(&rs)) == FinalSyncState::FinalSyncComplete
        {
            self.finish_final_sync(volume).await?;
            return Ok(SourceOutcome {
                final_sync_complete: true,
                source: Some(rs),
            });
        }

        Ok(SourceOutcome {
            final_sync_complete: false,
            source: Some(rs),
        })
    }

    /// Makes the application claim reflect the destination's latest
    /// completed sync. With `failover` on a direct-copy destination the claim
    /// is first rolled back to the last snapshot.
    #[instrument(skip(self, volume), fields(pvc = %volume.name, namespace = %volume.namespace))]
    pub async fn ensure_claim_from_destination(
        &self,
        volume: &ProtectedVolume,
        failover: bool,
    ) -> Result<Progress> {
        let snapshot_ref = self.latest_snapshot_reference(volume).await?;
        let snapshot = self
            .validate_and_protect_snapshot(&snapshot_ref, &volume.namespace)
            .await?;

        if self.is_copy_method_direct() {
            if self
                .get_claim(&volume.name, &volume.namespace)
                .await?
                .is_none()
            {
                return Err(Error::not_found(
                    "PersistentVolumeClaim",
                    format!("{}/{}", volume.namespace, volume.name),
                ));
            }
            if failover {
                if let Progress::Waiting(reason) =
                    self.rollback_to_last_snapshot(volume, &snapshot_ref).await?
                {
                    return Ok(Progress::Waiting(reason));
                }
            }
        } else {
            self.ensure_claim_from_snapshot(volume, &snapshot_ref, snapshot.restore_size())
                .await?;
        }

        self.add_back_platform_annotations(&volume.name, &volume.namespace, &volume.annotations)
            .await?;
        info!(snapshot = %snapshot_ref.name, "claim restored from destination");
        Ok(Progress::Done)
    }

    /// Prepares a primary claim for the next step of a relocation.
    ///
    /// With `prep_final_sync` the source stops scheduling and the claim is
    /// released to the application; for a direct-copy group outside any final
    /// sync the engine takes ownership of the claim instead.
    #[instrument(skip(self))]
    pub async fn prepare_claim(
        &self,
        name: &str,
        namespace: &str,
        prep_final_sync: bool,
        run_final_sync: bool,
    ) -> Result<Progress> {
        if self.is_copy_method_direct() && !prep_final_sync && !run_final_sync {
            if !self.take_ownership(name, namespace).await? {
                return Ok(Progress::waiting("claim not found, ownership not taken"));
            }
            return Ok(Progress::Done);
        }

        if prep_final_sync {
            return self.prepare_for_final_sync(name, namespace).await;
        }

        Ok(Progress::Done)
    }

    /// Deletes destinations of this group whose volume is no longer protected.
    /// On a secondary the matching claim goes too.
    #[instrument(skip(self, desired), fields(desired = desired.len()))]
    pub async fn cleanup_superseded_destinations(
        &self,
        desired: &[ProtectedVolume],
        role: ReplicationState,
    ) -> Result<()> {
        let destinations: Vec<ReplicationDestination> = self.list_owned(None).await?;

        for rd in destinations {
            if has_label(&rd.metadata, DO_NOT_DELETE_LABEL, TRUE) {
                continue;
            }
            let name = rd.name_any();
            let namespace = rd.namespace().unwrap_or_default();
            if desired
                .iter()
                .any(|v| v.name == name && v.namespace == namespace)
            {
                continue;
            }

            info!(rd = %name, %namespace, "destination no longer protected, deleting");
            if let Progress::Waiting(reason) = self.delete_destination(&name, &namespace).await? {
                warn!(rd = %name, %reason, "destination removal deferred");
                continue;
            }
            if role == ReplicationState::Secondary {
                self.delete_claim(&name, &namespace).await?;
            }
        }
        Ok(())
    }

    /// Reaps the local rollback pair once its final transfer has completed.
    #[instrument(skip(self, volume), fields(pvc = %volume.name, namespace = %volume.namespace))]
    pub async fn cleanup_local_rollback(&self, volume: &ProtectedVolume) -> Result<Progress> {
        let Some(rd) = self
            .get_destination(&destination_name(&volume.name), &volume.namespace)
            .await?
        else {
            return Ok(Progress::Done);
        };
        self.delete_local_replication(&rd).await
    }
}
