//! Finalizer handling for claims handed between the application and the engine
//!
//! While a final sync is pending the application's claim carries
//! [`CLAIM_PROTECTION_FINALIZER`], so deleting it leaves the claim terminating
//! (and its volume attached) until the engine has repointed the volume at the
//! temporary claim.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

pub const CLAIM_PROTECTION_FINALIZER: &str =
    "volumereplicationgroups.ramendr.openshift.io/pvc-volsync-protection";

pub fn add_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    let finalizers = meta.finalizers.get_or_insert_with(Vec::new);
    if finalizers.iter().any(|f| f == finalizer) {
        return false;
    }
    finalizers.push(finalizer.to_string());
    true
}

pub fn remove_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    let Some(finalizers) = meta.finalizers.as_mut() else {
        return false;
    };
    let before = finalizers.len();
    finalizers.retain(|f| f != finalizer);
    let changed = finalizers.len() != before;
    if finalizers.is_empty() {
        meta.finalizers = None;
    }
    changed
}

pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .iter()
        .flatten()
        .any(|f| f == finalizer)
}

/// A deletion timestamp means deletion was requested but finalizers hold the object.
pub fn is_being_deleted(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some()
}
