//! volsync-dr: replication-endpoint orchestration for volume disaster recovery
//!
//! Drives an asynchronous, snapshot-based volume replication data mover on
//! behalf of a replication group. On the secondary cluster it maintains the
//! receiving endpoints; on the primary it maintains the sending endpoints,
//! runs the final synchronization before failover and restores application
//! claims from replicated snapshots.

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod store;

pub use crate::error::{Error, Result};
