//! Typed shapes of the declarative objects the engine reads and writes
//!
//! The data mover's ReplicationDestination / ReplicationSource and the CSI
//! snapshotter's VolumeSnapshot / VolumeSnapshotClass are external CRDs, so
//! only the fields the engine touches are modelled. `protected` holds the
//! per-volume input handed over by the replication-group controller.

pub mod protected;
pub mod snapshot;
pub mod volsync;

pub use protected::{GroupOwner, ProtectedVolume, ReplicationState};
pub use snapshot::{
    VolumeSnapshot, VolumeSnapshotClass, VolumeSnapshotSource, VolumeSnapshotSpec,
    VolumeSnapshotStatus, SNAPSHOT_GROUP, VOLUME_SNAPSHOT_KIND,
};
pub use volsync::{
    CopyMethod, MoverStatus, ReplicationDestination, ReplicationDestinationRsyncTlsSpec,
    ReplicationDestinationRsyncTlsStatus, ReplicationDestinationSpec,
    ReplicationDestinationStatus, ReplicationSource, ReplicationSourceRsyncTlsSpec,
    ReplicationSourceSpec, ReplicationSourceStatus, ReplicationSourceTriggerSpec,
};
