//! Label, annotation and owner-reference helpers
//!
//! Every helper reports whether it changed anything so callers can skip
//! no-op writes.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

use crate::crd::GroupOwner;
use crate::error::{Error, Result};

/// Owner-name label used to list objects belonging to a replication group
pub const OWNER_NAME_LABEL: &str = "volumereplicationgroups-owner";
pub const OWNER_NAMESPACE_LABEL: &str = "volumereplicationgroups-owner-namespace";

/// Owner annotations, used where owner references cannot cross namespaces
pub const OWNER_NAME_ANNOTATION: &str = "ramendr.openshift.io/owner-name";
pub const OWNER_NAMESPACE_ANNOTATION: &str = "ramendr.openshift.io/owner-namespace";

pub const CREATED_BY_LABEL: &str = "ramendr.openshift.io/created-by-ramen";

/// Keeps the data mover and the superseded-destination sweep away from an object
pub const DO_NOT_DELETE_LABEL: &str = "volsync.backube/do-not-delete";

/// Keeps the application platform from deleting a claim it no longer deploys
pub const PLATFORM_DO_NOT_DELETE_ANNOTATION: &str = "apps.open-cluster-management.io/do-not-delete";
pub const PLATFORM_ANNOTATION_PREFIX: &str = "apps.open-cluster-management.io";

pub const TRUE: &str = "true";

pub fn add_label(meta: &mut ObjectMeta, key: &str, value: &str) -> bool {
    insert(meta.labels.get_or_insert_with(BTreeMap::new), key, value)
}

pub fn remove_label(meta: &mut ObjectMeta, key: &str) -> bool {
    meta.labels
        .as_mut()
        .is_some_and(|labels| labels.remove(key).is_some())
}

pub fn has_label(meta: &ObjectMeta, key: &str, value: &str) -> bool {
    meta.labels
        .as_ref()
        .and_then(|l| l.get(key))
        .is_some_and(|v| v == value)
}

pub fn add_annotation(meta: &mut ObjectMeta, key: &str, value: &str) -> bool {
    insert(meta.annotations.get_or_insert_with(BTreeMap::new), key, value)
}

pub fn remove_annotation(meta: &mut ObjectMeta, key: &str) -> bool {
    meta.annotations
        .as_mut()
        .is_some_and(|annotations| annotations.remove(key).is_some())
}

fn insert(map: &mut BTreeMap<String, String>, key: &str, value: &str) -> bool {
    if map.get(key).is_some_and(|v| v == value) {
        return false;
    }
    map.insert(key.to_string(), value.to_string());
    true
}

/// Labels that make an object discoverable by its owning group.
pub fn owner_labels(owner: &GroupOwner) -> BTreeMap<String, String> {
    BTreeMap::from([
        (OWNER_NAME_LABEL.to_string(), owner.name.clone()),
        (OWNER_NAMESPACE_LABEL.to_string(), owner.namespace.clone()),
    ])
}

pub fn add_owner_labels(meta: &mut ObjectMeta, owner: &GroupOwner) -> bool {
    let mut changed = false;
    for (k, v) in owner_labels(owner) {
        changed |= add_label(meta, &k, &v);
    }
    changed
}

pub fn add_owner_annotations(meta: &mut ObjectMeta, owner: &GroupOwner) -> bool {
    add_annotation(meta, OWNER_NAME_ANNOTATION, &owner.name)
        | add_annotation(meta, OWNER_NAMESPACE_ANNOTATION, &owner.namespace)
}

pub fn is_owned_by(meta: &ObjectMeta, owner: &GroupOwner) -> bool {
    has_label(meta, OWNER_NAME_LABEL, &owner.name)
        && has_label(meta, OWNER_NAMESPACE_LABEL, &owner.namespace)
}

/// Adds `reference` unless one with the same uid is present.
pub fn add_owner_reference(meta: &mut ObjectMeta, reference: OwnerReference) -> bool {
    let refs = meta.owner_references.get_or_insert_with(Vec::new);
    if refs.iter().any(|r| r.uid == reference.uid) {
        return false;
    }
    refs.push(reference);
    true
}

pub fn remove_owner_reference(meta: &mut ObjectMeta, uid: &str) -> bool {
    let Some(refs) = meta.owner_references.as_mut() else {
        return false;
    };
    let before = refs.len();
    refs.retain(|r| r.uid != uid);
    let changed = refs.len() != before;
    if refs.is_empty() {
        meta.owner_references = None;
    }
    changed
}

/// Makes `reference` the managing controller. Fails when a different
/// controller already manages the object.
pub fn set_controller_reference(meta: &mut ObjectMeta, reference: OwnerReference) -> Result<bool> {
    let refs = meta.owner_references.get_or_insert_with(Vec::new);
    if let Some(other) = refs
        .iter()
        .find(|r| r.controller == Some(true) && r.uid != reference.uid)
    {
        return Err(Error::ValidationError(format!(
            "object is already controlled by {} {}",
            other.kind, other.name
        )));
    }

    if let Some(existing) = refs.iter_mut().find(|r| r.uid == reference.uid) {
        if *existing == reference {
            return Ok(false);
        }
        *existing = reference;
        return Ok(true);
    }
    refs.push(reference);
    Ok(true)
}

/// Copies annotations carrying the application platform's prefix.
pub fn platform_annotations(source: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    source
        .iter()
        .filter(|(k, _)| k.starts_with(PLATFORM_ANNOTATION_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
