//! Final synchronization of a primary volume before relocation

mod common;

use common::*;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use volsync_dr::controller::finalizers::{has_finalizer, CLAIM_PROTECTION_FINALIZER};
use volsync_dr::controller::naming::{final_sync_claim_name, FINAL_SYNC_TRIGGER};
use volsync_dr::controller::{FinalSyncState, VOLUME_RETAINED_ANNOTATION};
use volsync_dr::crd::{CopyMethod, ReplicationSource};

fn observed(store: &volsync_dr::store::MemoryStore) -> FinalSyncState {
    FinalSyncState::observe(store.fetch::<ReplicationSource>(Some(NS), CLAIM).as_ref())
}

fn volume(store: &volsync_dr::store::MemoryStore) -> PersistentVolume {
    store.fetch(None, VOLUME).unwrap()
}

/// Walks a claim through prepare, deletion by the application, the final
/// transfer from the temporary claim and the cleanup afterwards.
async fn run_final_sync(
    copy_method: CopyMethod,
    finalizers: &[&str],
) -> std::sync::Arc<volsync_dr::store::MemoryStore> {
    let store = cluster();
    with_application_claim(&store, finalizers);
    let h = handler(&store, engine(copy_method));
    let pv = protected_volume();
    let tmp = final_sync_claim_name(CLAIM);

    let outcome = h.reconcile_source(&pv, false).await.unwrap();
    assert!(outcome.source.is_some());
    assert_eq!(observed(&store), FinalSyncState::Scheduled);

    assert!(h.prepare_claim(CLAIM, NS, true, false).await.unwrap().is_done());
    assert_eq!(observed(&store), FinalSyncState::PreparingFinalSync);

    // The application still holds its claim, so nothing moves yet.
    let outcome = h.reconcile_source(&pv, true).await.unwrap();
    assert!(!outcome.final_sync_complete);
    assert!(!store.contains::<PersistentVolumeClaim>(Some(NS), &tmp));

    // The application is removed; the engine's finalizer keeps the claim.
    assert!(client(&store)
        .delete::<PersistentVolumeClaim>(Some(NS), CLAIM)
        .await
        .unwrap());

    let outcome = h.reconcile_source(&pv, true).await.unwrap();
    assert!(!outcome.final_sync_complete);
    assert!(store.contains::<PersistentVolumeClaim>(Some(NS), &tmp));
    let retained = volume(&store);
    let spec = retained.spec.as_ref().unwrap();
    assert_eq!(spec.persistent_volume_reclaim_policy.as_deref(), Some("Retain"));
    assert_eq!(
        spec.claim_ref.as_ref().unwrap().name.as_deref(),
        Some(tmp.as_str())
    );
    assert!(retained
        .metadata
        .annotations
        .as_ref()
        .unwrap()
        .contains_key(VOLUME_RETAINED_ANNOTATION));

    let outcome = h.reconcile_source(&pv, true).await.unwrap();
    assert!(!outcome.final_sync_complete);
    assert_eq!(observed(&store), FinalSyncState::FinalSyncRunning);
    let rs: ReplicationSource = store.fetch(Some(NS), CLAIM).unwrap();
    assert_eq!(rs.spec.source_pvc, tmp);

    source_synced(&store, CLAIM, FINAL_SYNC_TRIGGER);
    let outcome = h.reconcile_source(&pv, true).await.unwrap();
    assert!(outcome.final_sync_complete);
    assert!(!store.contains::<PersistentVolumeClaim>(Some(NS), &tmp));

    let released = volume(&store);
    let spec = released.spec.as_ref().unwrap();
    assert_eq!(spec.persistent_volume_reclaim_policy.as_deref(), Some("Delete"));
    assert_eq!(
        spec.claim_ref.as_ref().unwrap().name.as_deref(),
        Some(CLAIM)
    );
    assert!(!released
        .metadata
        .annotations
        .unwrap_or_default()
        .contains_key(VOLUME_RETAINED_ANNOTATION));

    store
}

#[tokio::test]
async fn test_final_sync_snapshot_copy_removes_claims() {
    let store = run_final_sync(CopyMethod::Snapshot, &[]).await;
    assert!(!store.contains::<PersistentVolumeClaim>(Some(NS), CLAIM));
}

#[tokio::test]
async fn test_final_sync_direct_copy_keeps_claim() {
    let store = run_final_sync(CopyMethod::Direct, &[PVC_PROTECTION_FINALIZER]).await;

    let claim: PersistentVolumeClaim = store.fetch(Some(NS), CLAIM).unwrap();
    assert!(!has_finalizer(&claim.metadata, CLAIM_PROTECTION_FINALIZER));
    assert!(has_finalizer(&claim.metadata, PVC_PROTECTION_FINALIZER));
}

#[tokio::test]
async fn test_completed_final_sync_is_reported_again() {
    let store = run_final_sync(CopyMethod::Snapshot, &[]).await;
    let h = handler(&store, engine(CopyMethod::Snapshot));

    let outcome = h.reconcile_source(&protected_volume(), true).await.unwrap();
    assert!(outcome.final_sync_complete);
}

#[tokio::test]
async fn test_final_sync_without_claim_waits() {
    let store = cluster();
    let h = handler(&store, engine(CopyMethod::Snapshot));

    let outcome = h.reconcile_source(&protected_volume(), true).await.unwrap();
    assert!(!outcome.final_sync_complete);
    assert!(outcome.source.is_none());
}
