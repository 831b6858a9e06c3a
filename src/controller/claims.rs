//! Claim lookups and in-use detection

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::VolumeAttachment;
use tracing::{debug, info};

use super::handler::ReplicationHandler;
use crate::error::Result;
use crate::store::Selector;

pub(crate) fn pod_mounts_claim(pod: &Pod, claim: &str) -> bool {
    pod.spec
        .iter()
        .flat_map(|spec| spec.volumes.iter().flatten())
        .filter_map(|v| v.persistent_volume_claim.as_ref())
        .any(|source| source.claim_name == claim)
}

pub(crate) fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

pub(crate) fn claim_phase(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim.status.as_ref().and_then(|s| s.phase.as_deref())
}

pub(crate) fn bound_volume_name(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim
        .spec
        .as_ref()
        .and_then(|s| s.volume_name.as_deref())
        .filter(|n| !n.is_empty())
}

impl ReplicationHandler {
    pub async fn get_claim(&self, name: &str, namespace: &str) -> Result<Option<PersistentVolumeClaim>> {
        self.client.get(Some(namespace), name).await
    }

    pub async fn delete_claim(&self, name: &str, namespace: &str) -> Result<()> {
        if self
            .client
            .delete::<PersistentVolumeClaim>(Some(namespace), name)
            .await?
        {
            info!(pvc = name, %namespace, "deleted claim");
        }
        Ok(())
    }

    /// Whether a pod in `namespace` mounts the claim. With `must_be_ready`
    /// only ready pods count.
    pub async fn is_claim_in_use_by_pod(
        &self,
        name: &str,
        namespace: &str,
        must_be_ready: bool,
    ) -> Result<bool> {
        let pods: Vec<Pod> = self
            .client
            .list(Some(namespace), &Selector::everything())
            .await?;
        Ok(pods
            .iter()
            .filter(|pod| pod_mounts_claim(pod, name))
            .any(|pod| !must_be_ready || pod_is_ready(pod)))
    }

    /// Whether the volume bound to `claim` is attached to any node.
    pub async fn is_volume_attached(&self, claim: &PersistentVolumeClaim) -> Result<bool> {
        let Some(volume) = bound_volume_name(claim) else {
            return Ok(false);
        };
        let attachments: Vec<VolumeAttachment> =
            self.client.list(None, &Selector::everything()).await?;
        Ok(attachments
            .iter()
            .any(|va| va.spec.source.persistent_volume_name.as_deref() == Some(volume)))
    }

    /// False when the claim does not exist. Attachment is only consulted when
    /// no pod uses the claim and readiness is not required.
    pub async fn claim_exists_and_in_use(
        &self,
        name: &str,
        namespace: &str,
        must_be_ready: bool,
    ) -> Result<bool> {
        let Some(claim) = self.get_claim(name, namespace).await? else {
            return Ok(false);
        };

        let in_use = self.is_claim_in_use_by_pod(name, namespace, must_be_ready).await?;
        if in_use || must_be_ready {
            return Ok(in_use);
        }

        let attached = self.is_volume_attached(&claim).await?;
        debug!(pvc = name, attached, "checked volume attachment");
        Ok(attached)
    }
}
