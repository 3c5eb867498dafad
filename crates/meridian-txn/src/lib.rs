//! Snapshot-isolated transactions over a key-value service.
//!
//! The layer stacks three pieces. The commit table maps each
//! transaction's start timestamp to its commit timestamp (or the
//! aborted sentinel) and is written exactly once through check-and-set.
//! Snapshot transactions buffer writes, read through the commit table
//! at a fixed snapshot, and commit under row locks with write-write
//! conflict detection. The manager draws start timestamps, tracks open
//! transactions, and derives the watermarks that bound what the
//! sweeper may reclaim.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Per-table conflict and sweep classification.
pub mod conflict;
/// The transaction manager, open registry, and watermarks.
pub mod manager;
/// The commit table.
pub mod service;
/// Snapshot transactions.
pub mod snapshot;

pub use conflict::{ConflictDetectionManager, SweepStrategyManager};
pub use manager::{OpenGuard, OpenRegistry, TransactionManager, TxnStats, WatermarkSource};
pub use service::{CommitState, TransactionService};
pub use snapshot::{SnapshotTransaction, TransactionState};
