//! Replication endpoint orchestration
//!
//! The engine that creates, updates and tears down the replication endpoints
//! of a single protected volume. [`ReplicationHandler`] is the entry point;
//! the remaining modules extend it with one concern each.

mod claims;
mod destination;
pub mod finalizers;
mod handler;
pub mod meta;
pub mod naming;
mod ownership;
pub mod quantity;
mod rollback;
mod secrets;
mod snapshot_class;
mod source;

pub use destination::is_snapshot_reference;
pub use handler::{Progress, ReplicationHandler, SourceOutcome, WORKLOAD_STATUS_ACTIVE};
pub use ownership::VOLUME_RETAINED_ANNOTATION;
pub use rollback::local_sync_complete;
pub use snapshot_class::{select_snapshot_class, IS_DEFAULT_CLASS_ANNOTATION, STORAGE_ID_LABEL};
pub use source::{FinalSyncState, BIND_COMPLETED_ANNOTATION, USE_COPY_TRIGGER_ANNOTATION};
