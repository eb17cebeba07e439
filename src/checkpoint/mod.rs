//! Checkpoint & Recovery Manager: snapshot documents, durable stores and startup
//! recovery.

pub mod recovery;
pub mod snapshot;
pub mod store;

pub use recovery::{RecoveryAction, RecoveryManager, RecoveryPlan, RecoveryReport, RecoveryStep};
pub use snapshot::{Checkpoint, CheckpointReason, SessionSnapshot, SnapshotRecord, SCHEMA_VERSION};
pub use store::{CheckpointStore, FileSystemStore, MemoryStore, StoreError};
