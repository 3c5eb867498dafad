//! System-wide constants for Meridian.
//!
//! This module defines constants used across the transaction layer.
//! Values that mirror a configurable default are the fallback when the
//! configuration leaves the field unset.

// =============================================================================
// System Tables
// =============================================================================

/// Commit-record table: maps a transaction's start timestamp to its commit
/// timestamp (or the aborted sentinel). The sole source of truth for
/// visibility.
pub const TRANSACTION_TABLE: &str = "_transactions";

/// Table holding the persisted timestamp upper limit for KVS-backed bound
/// stores.
pub const TIMESTAMP_TABLE: &str = "_timestamp";

/// Table holding the cross-process persistent lock row.
pub const PERSISTED_LOCKS_TABLE: &str = "_persisted_locks";

/// Table holding per-table sweep progress records.
pub const SWEEP_PROGRESS_TABLE: &str = "_sweep_progress";

// =============================================================================
// Timestamp Allocation
// =============================================================================

/// Number of timestamps reserved ahead of the last returned value each time
/// the persisted upper limit is raised. Large enough that the bound store is
/// touched rarely, small enough that a crash wastes a negligible range.
pub const TIMESTAMP_ALLOCATION_BUFFER: u64 = 1_000_000;

/// Maximum number of timestamps handed out by a single batch request.
/// Larger requests are clamped, never rejected.
pub const MAX_TIMESTAMPS_PER_REQUEST: u64 = 10_000;

// =============================================================================
// Commit Records and CAS Cells
// =============================================================================

/// Version slot used for cells managed through check-and-set (commit
/// records, the persistent lock row, the timestamp bound). CAS-managed
/// cells are single-version; this slot is below every issued timestamp.
pub const CAS_CELL_TIMESTAMP: u64 = 0;

/// Commit-table value meaning "aborted". `Timestamp::ZERO` is never issued
/// by the oracle, so the encoding is unambiguous.
pub const ABORTED_COMMIT_VALUE: u64 = 0;

// =============================================================================
// Cell and Value Limits
// =============================================================================

/// Maximum combined size of a cell's row and column names in bytes.
pub const MAX_CELL_NAME_SIZE: usize = 1500;

/// Maximum value size in bytes (1 MB).
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

// =============================================================================
// Lock Service
// =============================================================================

/// Default lock acquisition timeout.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 10_000; // 10 seconds

/// Default lease duration for granted locks.
pub const DEFAULT_LEASE_DURATION_MS: u64 = 120_000; // 2 minutes

/// Interval at which the background refresher renews registered tokens.
/// Must be well below the lease duration.
pub const LOCK_REFRESH_INTERVAL_MS: u64 = 5_000;

// =============================================================================
// Consensus
// =============================================================================

/// Maximum number of nodes in a cluster.
pub const MAX_CLUSTER_SIZE: usize = 50;

/// Proposal attempts before a proposer gives up with a quorum error.
pub const DEFAULT_PROPOSAL_RETRIES: u32 = 10;

/// Lower bound of the randomized backoff between proposal attempts.
pub const PROPOSAL_BACKOFF_MIN_MS: u64 = 5;

/// Upper bound of the randomized backoff between proposal attempts.
pub const PROPOSAL_BACKOFF_MAX_MS: u64 = 50;

// =============================================================================
// Transactions
// =============================================================================

/// Default number of attempts for the retrying transaction runner.
pub const DEFAULT_TRANSACTION_RETRIES: u32 = 3;

/// How many times a read re-checks a dependency whose commit record is
/// still absent before fencing it with the aborted sentinel.
pub const PENDING_COMMIT_RETRY_LIMIT: u32 = 16;

/// Pause between those re-checks.
pub const PENDING_COMMIT_RETRY_PAUSE_MS: u64 = 2;

// =============================================================================
// Sweep
// =============================================================================

/// Pause between background sweep iterations.
pub const DEFAULT_SWEEP_PAUSE_MILLIS: u64 = 5_000;

/// Pause before the background loop retries a persistent lock held by a
/// backup.
pub const DEFAULT_SWEEP_PERSISTENT_LOCK_WAIT_MILLIS: u64 = 30_000;

/// Default number of candidate cells fetched per sweep batch.
pub const DEFAULT_SWEEP_CANDIDATE_BATCH_SIZE: usize = 128;

/// Default number of (cell, timestamp) pairs deleted per mutation batch.
pub const DEFAULT_SWEEP_DELETE_BATCH_SIZE: usize = 128;

/// Default budget of (cell, timestamp) pairs examined per sweep run.
pub const DEFAULT_SWEEP_READ_LIMIT: usize = 16_384;

// =============================================================================
// Timeouts and Intervals
// =============================================================================

/// Default operation timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000; // 30 seconds

/// Interval at which the leadership supervisor re-verifies the current
/// role.
pub const LEADERSHIP_CHECK_INTERVAL_MS: u64 = 1_000;
