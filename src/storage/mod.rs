//! Disk-backed state for the hub
//!
//! Every stateful component sits on a [`KvTable`]: a keyed JSON map persisted
//! to its own SQLite file, one directory per logical table. The
//! [`BackupSupervisor`] snapshots tables on a timer and handles corruption
//! escalation.

pub mod backup;
pub mod kv;

pub use backup::BackupSupervisor;
pub use kv::{CorruptionReport, KvTable, StoreError};
