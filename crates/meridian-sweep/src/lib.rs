//! Version reclamation for swept tables.
//!
//! Committed history accumulates: every write leaves a version behind,
//! and deletes leave tombstones. The sweeper walks tables for cells
//! with reclaimable versions and deletes everything no open or future
//! snapshot can ever read, bounded by the transaction layer's
//! watermarks. A cross-process persistent lock keeps sweeping and
//! backups from overlapping, and per-table progress records make the
//! work resumable across restarts.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// The background sweep loop.
pub mod background;
/// The cross-process persistent lock.
pub mod lock;
/// Persisted sweep progress.
pub mod progress;
/// The manual sweep trigger.
pub mod service;
/// The sweep task runner.
pub mod task;

pub use background::{BackgroundSweepSettings, BackgroundSweeper};
pub use lock::{
    create_persistent_lock_service, KvsBackedPersistentLockService, LockEntry,
    NoOpPersistentLockService, PersistentLockManager, PersistentLockService,
};
pub use progress::{SweepProgress, SweepProgressStore};
pub use service::{SweepConfigOverrides, SweepRequest, SweepResponse, SweeperService};
pub use task::{CellsSweeper, SweepBatchConfig, SweepOutcome, SweepTaskRunner};
