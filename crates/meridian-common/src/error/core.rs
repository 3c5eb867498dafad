//! Core error types.
//!
//! Provides the error taxonomy for the whole transaction layer: typed,
//! code-stable, and explicit about which failures a caller may retry.

use std::fmt;
use thiserror::Error;

use crate::types::{LockToken, NodeId, Timestamp};

/// Error codes for categorizing errors.
///
/// These codes can be used for programmatic error handling and
/// are stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    // General errors (0x0000 - 0x00FF)
    /// Unknown or unspecified error.
    Unknown = 0x0000,
    /// Internal error (bug).
    Internal = 0x0001,
    /// Operation not supported.
    NotSupported = 0x0002,
    /// Invalid argument provided.
    InvalidArgument = 0x0003,
    /// Operation timed out.
    Timeout = 0x0004,
    /// Service is shutting down.
    ShuttingDown = 0x0005,

    // Storage errors (0x0100 - 0x01FF)
    /// General I/O error.
    Io = 0x0100,
    /// Table not found.
    TableNotFound = 0x0101,
    /// Malformed table name.
    InvalidTableName = 0x0102,
    /// Check-and-set found an unexpected value.
    CheckAndSetFailed = 0x0103,
    /// Cell name too large.
    CellNameTooLarge = 0x0104,
    /// Value too large.
    ValueTooLarge = 0x0105,
    /// Stored data failed validation.
    Corruption = 0x0106,

    // Transaction errors (0x0200 - 0x02FF)
    /// Write-write conflict detected.
    TransactionConflict = 0x0200,
    /// Transaction was aborted.
    TransactionAborted = 0x0201,
    /// Operation on a transaction that already reached a terminal state.
    TransactionClosed = 0x0202,
    /// Retry budget exhausted.
    TooManyRetries = 0x0203,

    // Lock errors (0x0300 - 0x03FF)
    /// Lock acquisition timed out.
    LockTimeout = 0x0300,
    /// Lock token not (or no longer) held.
    LockTokenNotHeld = 0x0301,
    /// Persistent lock already held.
    PersistentLockHeld = 0x0302,
    /// Persistent lock not held by this caller.
    PersistentLockNotHeld = 0x0303,

    // Consensus errors (0x0400 - 0x04FF)
    /// Not the leader.
    NotLeader = 0x0400,
    /// Leader unknown.
    LeaderUnknown = 0x0401,
    /// Quorum not reached.
    QuorumNotReached = 0x0402,
    /// Consensus round failed.
    ConsensusFailed = 0x0403,

    // Sweep errors (0x0500 - 0x05FF)
    /// Table may not be swept.
    TableNotSweepable = 0x0500,

    // Configuration errors (0x0600 - 0x06FF)
    /// Invalid configuration.
    InvalidConfig = 0x0600,
    /// Invalid client name.
    InvalidClientName = 0x0601,
}

impl ErrorCode {
    /// Returns the numeric code.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns the error category name.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match (*self as u16) >> 8 {
            0x00 => "General",
            0x01 => "Storage",
            0x02 => "Transaction",
            0x03 => "Lock",
            0x04 => "Consensus",
            0x05 => "Sweep",
            0x06 => "Config",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The main error type for Meridian.
///
/// This enum covers all failures that cross a component boundary. Each
/// variant includes relevant context for debugging; `is_retryable` tells a
/// caller whether rerunning the whole operation (for transactions: from a
/// fresh start timestamp) can succeed.
///
/// # Example
///
/// ```rust
/// use meridian_common::error::{MeridianError, MeridianResult};
/// use meridian_common::types::Timestamp;
///
/// fn commit(start: Timestamp) -> MeridianResult<()> {
///     Err(MeridianError::TransactionAborted { start_ts: start })
/// }
/// ```
#[derive(Debug, Error)]
pub enum MeridianError {
    // ==========================================================================
    // General Errors
    // ==========================================================================
    /// Internal error - this indicates a bug.
    #[error("internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },

    /// Operation not supported.
    #[error("operation not supported: {operation}")]
    NotSupported {
        /// The unsupported operation.
        operation: String,
    },

    /// Invalid argument provided.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Error message.
        message: String,
    },

    /// Operation timed out.
    #[error("{operation} timed out after {waited_ms}ms")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// How long it waited, in milliseconds.
        waited_ms: u64,
    },

    /// Service is shutting down.
    #[error("service is shutting down")]
    ShuttingDown,

    // ==========================================================================
    // Storage Errors
    // ==========================================================================
    /// I/O error from the underlying system.
    #[error("I/O error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Table not found.
    #[error("table '{table}' not found")]
    TableNotFound {
        /// The missing table.
        table: String,
    },

    /// Malformed table name.
    #[error("invalid table name '{name}': {reason}")]
    InvalidTableName {
        /// The offending name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Check-and-set found an unexpected value.
    ///
    /// For commit records this means another attempt already finalized the
    /// transaction; for persistent locks it means "already held".
    #[error("check-and-set on table '{table}' found an unexpected value")]
    CheckAndSetFailed {
        /// The table the CAS targeted.
        table: String,
    },

    /// Cell name too large.
    #[error("cell name size {size} exceeds maximum {max_size}")]
    CellNameTooLarge {
        /// Actual combined row+column size.
        size: usize,
        /// Maximum allowed size.
        max_size: usize,
    },

    /// Value too large.
    #[error("value size {size} exceeds maximum {max_size}")]
    ValueTooLarge {
        /// Actual value size.
        size: usize,
        /// Maximum allowed size.
        max_size: usize,
    },

    /// Stored data failed validation.
    #[error("data corruption detected: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    // ==========================================================================
    // Transaction Errors
    // ==========================================================================
    /// Write-write conflict: another transaction committed to an
    /// overlapping cell between this transaction's start and commit.
    #[error(
        "write-write conflict on table '{table}': {cells} cell(s) were \
         committed by a concurrent transaction"
    )]
    TransactionConflict {
        /// The table the conflict occurred on.
        table: String,
        /// Number of conflicting cells.
        cells: usize,
    },

    /// Transaction was aborted.
    #[error("transaction with start timestamp {start_ts} was aborted")]
    TransactionAborted {
        /// The aborted transaction's start timestamp.
        start_ts: Timestamp,
    },

    /// Operation on a transaction that already reached a terminal state.
    #[error("transaction {start_ts} is {state} and accepts no further operations")]
    TransactionClosed {
        /// The transaction's start timestamp.
        start_ts: Timestamp,
        /// The terminal state it is in.
        state: String,
    },

    /// Retry budget exhausted.
    #[error("giving up after {attempts} attempts; last error: {last_error}")]
    TooManyRetries {
        /// How many attempts were made.
        attempts: u32,
        /// Description of the final failure.
        last_error: String,
    },

    // ==========================================================================
    // Lock Errors
    // ==========================================================================
    /// Lock acquisition timed out.
    #[error("lock acquisition timed out after {waited_ms}ms")]
    LockTimeout {
        /// How long the caller waited, in milliseconds.
        waited_ms: u64,
    },

    /// Lock token not (or no longer) held.
    #[error("lock token {token} is not held (expired or already released)")]
    LockTokenNotHeld {
        /// The unknown token.
        token: LockToken,
    },

    /// Persistent lock already held.
    #[error("persistent lock already held by {holder}")]
    PersistentLockHeld {
        /// Description of the current holder.
        holder: String,
    },

    /// Persistent lock not held by this caller.
    #[error("persistent lock release refused: {details}")]
    PersistentLockNotHeld {
        /// What the lock row actually contained.
        details: String,
    },

    // ==========================================================================
    // Consensus Errors
    // ==========================================================================
    /// This node is not the leader.
    #[error("not the leader, leader is {leader_hint:?}")]
    NotLeader {
        /// The current leader, if known.
        leader_hint: Option<NodeId>,
    },

    /// Leader is unknown.
    #[error("leader is unknown")]
    LeaderUnknown,

    /// Quorum not reached.
    #[error("quorum not reached: got {received} of {required} responses")]
    QuorumNotReached {
        /// Responses received.
        received: usize,
        /// Responses required.
        required: usize,
    },

    /// Consensus round failed.
    #[error("consensus failed: {reason}")]
    ConsensusFailed {
        /// Reason for failure.
        reason: String,
    },

    // ==========================================================================
    // Sweep Errors
    // ==========================================================================
    /// Table may not be swept.
    #[error("table '{table}' may not be swept: {reason}")]
    TableNotSweepable {
        /// The protected table.
        table: String,
        /// Why sweeping is refused.
        reason: String,
    },

    // ==========================================================================
    // Configuration Errors
    // ==========================================================================
    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Error message.
        message: String,
    },

    /// Invalid client name.
    #[error("invalid client name '{name}': {reason}")]
    InvalidClientName {
        /// The offending name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl MeridianError {
    /// Returns the error code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Internal { .. } => ErrorCode::Internal,
            Self::NotSupported { .. } => ErrorCode::NotSupported,
            Self::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::ShuttingDown => ErrorCode::ShuttingDown,
            Self::Io { .. } => ErrorCode::Io,
            Self::TableNotFound { .. } => ErrorCode::TableNotFound,
            Self::InvalidTableName { .. } => ErrorCode::InvalidTableName,
            Self::CheckAndSetFailed { .. } => ErrorCode::CheckAndSetFailed,
            Self::CellNameTooLarge { .. } => ErrorCode::CellNameTooLarge,
            Self::ValueTooLarge { .. } => ErrorCode::ValueTooLarge,
            Self::Corruption { .. } => ErrorCode::Corruption,
            Self::TransactionConflict { .. } => ErrorCode::TransactionConflict,
            Self::TransactionAborted { .. } => ErrorCode::TransactionAborted,
            Self::TransactionClosed { .. } => ErrorCode::TransactionClosed,
            Self::TooManyRetries { .. } => ErrorCode::TooManyRetries,
            Self::LockTimeout { .. } => ErrorCode::LockTimeout,
            Self::LockTokenNotHeld { .. } => ErrorCode::LockTokenNotHeld,
            Self::PersistentLockHeld { .. } => ErrorCode::PersistentLockHeld,
            Self::PersistentLockNotHeld { .. } => ErrorCode::PersistentLockNotHeld,
            Self::NotLeader { .. } => ErrorCode::NotLeader,
            Self::LeaderUnknown => ErrorCode::LeaderUnknown,
            Self::QuorumNotReached { .. } => ErrorCode::QuorumNotReached,
            Self::ConsensusFailed { .. } => ErrorCode::ConsensusFailed,
            Self::TableNotSweepable { .. } => ErrorCode::TableNotSweepable,
            Self::InvalidConfig { .. } => ErrorCode::InvalidConfig,
            Self::InvalidClientName { .. } => ErrorCode::InvalidClientName,
        }
    }

    /// Returns true if retrying the whole operation can succeed.
    ///
    /// For transactions "retrying" means rerunning from a fresh start
    /// timestamp, not repeating the failed commit.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::CheckAndSetFailed { .. }
                | Self::TransactionConflict { .. }
                | Self::TransactionAborted { .. }
                | Self::LockTimeout { .. }
                | Self::PersistentLockHeld { .. }
                | Self::NotLeader { .. }
                | Self::LeaderUnknown
                | Self::QuorumNotReached { .. }
        )
    }

    /// Returns true if this error represents a transaction conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::TransactionConflict { .. } | Self::TransactionAborted { .. }
        )
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    #[must_use]
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates a table-not-found error.
    #[must_use]
    pub fn table_not_found(table: impl Into<String>) -> Self {
        Self::TableNotFound {
            table: table.into(),
        }
    }

    /// Creates an invalid-table-name error.
    #[must_use]
    pub fn invalid_table_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTableName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Creates a check-and-set failure for the given table.
    #[must_use]
    pub fn cas_failed(table: impl Into<String>) -> Self {
        Self::CheckAndSetFailed {
            table: table.into(),
        }
    }

    /// Creates a write-write conflict error.
    #[must_use]
    pub fn conflict(table: impl Into<String>, cells: usize) -> Self {
        Self::TransactionConflict {
            table: table.into(),
            cells,
        }
    }

    /// Creates a not-leader error with an optional leader hint.
    #[must_use]
    pub const fn not_leader(leader_hint: Option<NodeId>) -> Self {
        Self::NotLeader { leader_hint }
    }

    /// Creates an invalid configuration error.
    #[must_use]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}
