//! Ownership transfer of claims and their volumes
//!
//! A claim is either held by the engine (owner reference plus the
//! platform's do-not-delete annotation) or released to the application
//! (protection finalizer only). Volumes are kept with a Retain policy while
//! they are bound to a claim other than the application's.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolume};
use tracing::{debug, info, instrument};

use super::finalizers::{add_finalizer, remove_finalizer, CLAIM_PROTECTION_FINALIZER};
use super::handler::ReplicationHandler;
use super::meta::{
    add_annotation, add_owner_reference, platform_annotations, remove_annotation, remove_label,
    remove_owner_reference, CREATED_BY_LABEL, DO_NOT_DELETE_LABEL, OWNER_NAMESPACE_LABEL,
    OWNER_NAME_LABEL, PLATFORM_DO_NOT_DELETE_ANNOTATION, TRUE,
};
use crate::crd::ProtectedVolume;
use crate::error::{Error, Result};

/// Marks a volume whose reclaim policy the engine switched to Retain
pub const VOLUME_RETAINED_ANNOTATION: &str =
    "volumereplicationgroups.ramendr.openshift.io/volsync-retained";
const VOLUME_RETAINED_VALUE: &str = "retained";

const RECLAIM_RETAIN: &str = "Retain";
const RECLAIM_DELETE: &str = "Delete";

fn reclaim_policy(pv: &PersistentVolume) -> Option<&str> {
    pv.spec
        .as_ref()
        .and_then(|s| s.persistent_volume_reclaim_policy.as_deref())
}

fn claim_ref(pv: &PersistentVolume) -> Option<&ObjectReference> {
    pv.spec.as_ref().and_then(|s| s.claim_ref.as_ref())
}

fn points_at(pv: &PersistentVolume, claim: &str, namespace: &str) -> bool {
    claim_ref(pv).is_some_and(|r| {
        r.name.as_deref() == Some(claim) && r.namespace.as_deref() == Some(namespace)
    })
}

/// Points the volume at `claim`, dropping the uid and resourceVersion of the
/// previous binding so the binder accepts the new claim.
fn rewrite_claim_ref(pv: &mut PersistentVolume, claim: &str, namespace: &str) {
    let spec = pv.spec.get_or_insert_with(Default::default);
    spec.claim_ref = Some(ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("PersistentVolumeClaim".to_string()),
        name: Some(claim.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    });
}

fn set_reclaim_policy(pv: &mut PersistentVolume, policy: &str) {
    pv.spec
        .get_or_insert_with(Default::default)
        .persistent_volume_reclaim_policy = Some(policy.to_string());
}

impl ReplicationHandler {
    async fn get_volume(&self, name: &str) -> Result<PersistentVolume> {
        self.client
            .get::<PersistentVolume>(None, name)
            .await?
            .ok_or_else(|| Error::not_found("PersistentVolume", name))
    }

    /// Takes the claim away from the application platform. Returns `false`
    /// when the claim does not exist.
    #[instrument(skip(self))]
    pub async fn take_ownership(&self, claim: &str, namespace: &str) -> Result<bool> {
        let Some(existing) = self.get_claim(claim, namespace).await? else {
            return Ok(false);
        };

        let mut owned = existing.clone();
        add_annotation(&mut owned.metadata, PLATFORM_DO_NOT_DELETE_ANNOTATION, TRUE);
        if self.owner_references_allowed() {
            add_owner_reference(&mut owned.metadata, self.owner.owner_reference(false));
        }
        if self.client.update_if_changed(&existing, &owned).await? {
            info!("took ownership of claim");
        }
        Ok(true)
    }

    /// Returns the claim to the application while keeping it from being
    /// deleted under the engine until the final sync is done.
    #[instrument(skip(self))]
    pub async fn release_ownership(&self, claim: &str, namespace: &str) -> Result<bool> {
        let Some(existing) = self.get_claim(claim, namespace).await? else {
            debug!("claim not found, nothing to release");
            return Ok(false);
        };

        let mut released = existing.clone();
        add_finalizer(&mut released.metadata, CLAIM_PROTECTION_FINALIZER);
        remove_annotation(&mut released.metadata, PLATFORM_DO_NOT_DELETE_ANNOTATION);
        remove_owner_reference(&mut released.metadata, &self.owner.uid);
        if self.client.update_if_changed(&existing, &released).await? {
            info!("released ownership of claim");
        }
        Ok(true)
    }

    /// Keeps `volume` alive past its claim and binds it to `claim`.
    #[instrument(skip(self))]
    pub async fn retain_volume(&self, volume: &str, claim: &str, namespace: &str) -> Result<()> {
        let pv = self.get_volume(volume).await?;

        let mut retained = pv.clone();
        add_annotation(
            &mut retained.metadata,
            VOLUME_RETAINED_ANNOTATION,
            VOLUME_RETAINED_VALUE,
        );
        if reclaim_policy(&pv) != Some(RECLAIM_RETAIN) || !points_at(&pv, claim, namespace) {
            set_reclaim_policy(&mut retained, RECLAIM_RETAIN);
            rewrite_claim_ref(&mut retained, claim, namespace);
        }

        if self.client.update_if_changed(&pv, &retained).await? {
            info!("volume retained and rebound");
        }
        Ok(())
    }

    /// Inverse of [`retain_volume`](Self::retain_volume).
    #[instrument(skip(self))]
    pub async fn unretain_volume(&self, volume: &str, claim: &str, namespace: &str) -> Result<()> {
        let pv = self.get_volume(volume).await?;

        let mut restored = pv.clone();
        remove_annotation(&mut restored.metadata, VOLUME_RETAINED_ANNOTATION);
        if reclaim_policy(&pv) != Some(RECLAIM_DELETE) || !points_at(&pv, claim, namespace) {
            set_reclaim_policy(&mut restored, RECLAIM_DELETE);
            rewrite_claim_ref(&mut restored, claim, namespace);
        }

        if self.client.update_if_changed(&pv, &restored).await? {
            info!("volume returned to its claim");
        }
        Ok(())
    }

    /// Stops protecting the claim: its source goes away and every marker the
    /// engine placed on the claim is removed.
    #[instrument(skip(self, volume), fields(pvc = %volume.name, namespace = %volume.namespace))]
    pub async fn unprotect_claim(&self, volume: &ProtectedVolume) -> Result<()> {
        self.delete_source(&volume.name, &volume.namespace).await?;

        let Some(existing) = self.get_claim(&volume.name, &volume.namespace).await? else {
            return Ok(());
        };
        let mut unprotected = existing.clone();
        for label in [
            CREATED_BY_LABEL,
            OWNER_NAME_LABEL,
            OWNER_NAMESPACE_LABEL,
            DO_NOT_DELETE_LABEL,
        ] {
            remove_label(&mut unprotected.metadata, label);
        }
        remove_finalizer(&mut unprotected.metadata, CLAIM_PROTECTION_FINALIZER);
        remove_owner_reference(&mut unprotected.metadata, &self.owner.uid);
        if self.client.update_if_changed(&existing, &unprotected).await? {
            info!("claim unprotected");
        }
        Ok(())
    }

    /// Detaches the claim from the group without touching replication.
    pub async fn disown_claim(&self, claim: &str, namespace: &str) -> Result<()> {
        let Some(existing) = self.get_claim(claim, namespace).await? else {
            return Ok(());
        };
        let mut disowned = existing.clone();
        remove_owner_reference(&mut disowned.metadata, &self.owner.uid);
        remove_annotation(&mut disowned.metadata, PLATFORM_DO_NOT_DELETE_ANNOTATION);
        if self.client.update_if_changed(&existing, &disowned).await? {
            info!(pvc = claim, "claim disowned");
        }
        Ok(())
    }

    /// Re-applies the platform annotations recorded for the claim, which a
    /// restore from snapshot would otherwise lose.
    pub async fn add_back_platform_annotations(
        &self,
        claim: &str,
        namespace: &str,
        recorded: &BTreeMap<String, String>,
    ) -> Result<()> {
        let wanted = platform_annotations(recorded);
        if wanted.is_empty() {
            return Ok(());
        }
        let Some(existing) = self.get_claim(claim, namespace).await? else {
            return Err(Error::not_found(
                "PersistentVolumeClaim",
                format!("{namespace}/{claim}"),
            ));
        };
        let mut annotated = existing.clone();
        for (k, v) in &wanted {
            add_annotation(&mut annotated.metadata, k, v);
        }
        self.client.update_if_changed(&existing, &annotated).await?;
        Ok(())
    }
}
