//! Key-value service trait and request types.
//!
//! The service models tables of cells, each cell holding multiple
//! versions tagged with a [`Timestamp`]. Reads address a version bound,
//! writes address an exact version, and an optional check-and-set
//! primitive provides single-row atomicity for the metadata tables that
//! need it (commit records, timestamp bounds, persisted locks).

use bytes::Bytes;
use meridian_common::error::{MeridianError, MeridianResult};
use meridian_common::types::{Cell, TableRef, Timestamp, Value};
use meridian_common::{MAX_CELL_NAME_SIZE, MAX_VALUE_SIZE};
use serde::{Deserialize, Serialize};

/// How concurrent writes to the same cell are treated at commit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictHandler {
    /// Writes never conflict. Last committed version wins.
    IgnoreAll,
    /// Write-write conflicts abort the later committer.
    RetryOnWriteWrite,
}

/// How aggressively old versions of a table may be reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepStrategy {
    /// Never sweep this table.
    Nothing,
    /// Keep the newest committed version below the watermark, even when
    /// it is a delete tombstone.
    Conservative,
    /// Additionally remove a retained tombstone when it is the newest
    /// version of the cell overall.
    Thorough,
}

/// Per-table behavior declared at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Conflict handling applied during transaction commit.
    pub conflict_handler: ConflictHandler,
    /// Version reclamation policy applied by the sweeper.
    pub sweep_strategy: SweepStrategy,
}

impl TableSchema {
    /// Creates a schema with the given handlers.
    #[must_use]
    pub const fn new(conflict_handler: ConflictHandler, sweep_strategy: SweepStrategy) -> Self {
        Self {
            conflict_handler,
            sweep_strategy,
        }
    }

    /// Schema for internal metadata tables: no conflict checking, never
    /// swept.
    #[must_use]
    pub const fn system() -> Self {
        Self::new(ConflictHandler::IgnoreAll, SweepStrategy::Nothing)
    }
}

impl Default for TableSchema {
    /// Serializable user tables with conservative sweep.
    fn default() -> Self {
        Self::new(
            ConflictHandler::RetryOnWriteWrite,
            SweepStrategy::Conservative,
        )
    }
}

/// A value together with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    /// The stored bytes.
    pub value: Value,
    /// The version tag of the stored bytes.
    pub ts: Timestamp,
}

impl VersionedValue {
    /// Creates a versioned value.
    #[must_use]
    pub const fn new(value: Value, ts: Timestamp) -> Self {
        Self { value, ts }
    }
}

/// One column of a check-and-set request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnUpdate {
    /// Column name within the request's row.
    pub column: Bytes,
    /// Expected current value. `None` means the column must be absent.
    pub expected: Option<Value>,
    /// Value to store when the expectation holds.
    pub new_value: Value,
}

/// An atomic conditional update of one or more columns in a single row.
///
/// All expectations are checked and all updates applied as one unit:
/// either every column matched and every new value is stored, or nothing
/// changes and the request fails with `CheckAndSetFailed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckAndSetRequest {
    /// Target table.
    pub table: TableRef,
    /// Row shared by every updated column.
    pub row: Bytes,
    /// Column expectations and replacement values.
    pub updates: Vec<ColumnUpdate>,
}

impl CheckAndSetRequest {
    /// Single-column request with an explicit expectation.
    #[must_use]
    pub fn single_column(
        table: TableRef,
        row: impl Into<Bytes>,
        column: impl Into<Bytes>,
        expected: Option<Value>,
        new_value: Value,
    ) -> Self {
        Self {
            table,
            row: row.into(),
            updates: vec![ColumnUpdate {
                column: column.into(),
                expected,
                new_value,
            }],
        }
    }

    /// Request that stores a cell only while it is still absent.
    #[must_use]
    pub fn new_cell(table: TableRef, cell: &Cell, new_value: Value) -> Self {
        Self::single_column(table, cell.row_bytes(), cell.column_bytes(), None, new_value)
    }

    /// Request that replaces a cell only while it still holds `expected`.
    #[must_use]
    pub fn update_cell(table: TableRef, cell: &Cell, expected: Value, new_value: Value) -> Self {
        Self::single_column(
            table,
            cell.row_bytes(),
            cell.column_bytes(),
            Some(expected),
            new_value,
        )
    }
}

/// Cursor and limits for one candidate scan request.
#[derive(Debug, Clone)]
pub struct CandidateCellsRequest {
    /// Resume position. `None` starts from the beginning of the table.
    pub start_row: Option<Bytes>,
    /// Soft cap on returned candidates, applied at row boundaries.
    pub candidate_batch_size: usize,
    /// Soft cap on examined cell/version pairs, applied at row
    /// boundaries.
    pub max_cell_ts_pairs: usize,
}

/// A cell the sweeper should look at, with everything known about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateCell {
    /// The candidate cell.
    pub cell: Cell,
    /// Every stored version tag, ascending.
    pub timestamps: Vec<Timestamp>,
    /// True when the newest stored version is a delete tombstone.
    pub latest_value_empty: bool,
}

/// Result of one candidate scan request.
#[derive(Debug, Clone)]
pub struct CandidateBatch {
    /// Candidates found in this batch, in cell order.
    pub candidates: Vec<CandidateCell>,
    /// Resume row for the next request. `None` when the table is
    /// exhausted.
    pub next_start_row: Option<Bytes>,
    /// Number of cell/version pairs the scan looked at.
    pub cell_ts_pairs_examined: usize,
}

impl CandidateBatch {
    /// An empty batch marking an exhausted table.
    #[must_use]
    pub fn exhausted(cell_ts_pairs_examined: usize) -> Self {
        Self {
            candidates: Vec::new(),
            next_start_row: None,
            cell_ts_pairs_examined,
        }
    }
}

/// Trait for versioned cell storage backends.
///
/// Implementations provide durability and single-cell atomicity only.
/// They do not order concurrent writers, do not check conflicts, and are
/// free to expose partially written transactions to raw reads; the
/// transaction protocol is responsible for never interpreting such
/// state as committed data.
///
/// All methods are safe to call from multiple threads.
pub trait KeyValueService: Send + Sync {
    /// Creates a table with the given schema.
    ///
    /// Creating a table that already exists with an identical schema is
    /// a no-op, so every node of a cluster can run creation at startup.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the table exists with a different schema.
    fn create_table(&self, table: &TableRef, schema: &TableSchema) -> MeridianResult<()>;

    /// Returns whether the table exists.
    fn table_exists(&self, table: &TableRef) -> bool;

    /// Returns the schema a table was created with.
    ///
    /// # Errors
    ///
    /// `TableNotFound` when the table does not exist.
    fn get_table_schema(&self, table: &TableRef) -> MeridianResult<TableSchema>;

    /// Returns every table name, in sorted order.
    fn get_all_table_names(&self) -> Vec<TableRef>;

    /// Returns the newest version of `cell` with tag at most `max_ts`,
    /// or `None` when no such version exists.
    ///
    /// Delete tombstones are returned like any other value; callers
    /// decide what emptiness means.
    ///
    /// # Errors
    ///
    /// `TableNotFound` when the table does not exist.
    fn get(
        &self,
        table: &TableRef,
        cell: &Cell,
        max_ts: Timestamp,
    ) -> MeridianResult<Option<VersionedValue>>;

    /// Stores every `(cell, value)` pair at version `ts`.
    ///
    /// Writing a `(cell, ts)` pair that already exists replaces it.
    ///
    /// # Errors
    ///
    /// `TableNotFound`, `CellNameTooLarge`, or `ValueTooLarge`.
    fn put(&self, table: &TableRef, writes: &[(Cell, Value)], ts: Timestamp) -> MeridianResult<()>;

    /// Removes the exact version `(cell, ts)` if present.
    ///
    /// Deleting a version that does not exist is a no-op, so retried
    /// sweep batches stay safe.
    ///
    /// # Errors
    ///
    /// `TableNotFound` when the table does not exist.
    fn delete(&self, table: &TableRef, cell: &Cell, ts: Timestamp) -> MeridianResult<()>;

    /// Returns every version tag stored for `cell`, ascending.
    ///
    /// # Errors
    ///
    /// `TableNotFound` when the table does not exist.
    fn get_all_timestamps(&self, table: &TableRef, cell: &Cell) -> MeridianResult<Vec<Timestamp>>;

    /// Atomically applies a conditional multi-column update.
    ///
    /// # Errors
    ///
    /// `CheckAndSetFailed` when any column's expectation does not hold,
    /// `NotSupported` when [`supports_check_and_set`] is false, and
    /// `TableNotFound` or `InvalidArgument` for malformed requests.
    ///
    /// [`supports_check_and_set`]: KeyValueService::supports_check_and_set
    fn check_and_set(&self, request: &CheckAndSetRequest) -> MeridianResult<()>;

    /// Whether [`check_and_set`] is implemented by this backend.
    ///
    /// Callers that can degrade (the persisted lock service) must check
    /// this before relying on conditional updates.
    ///
    /// [`check_and_set`]: KeyValueService::check_and_set
    fn supports_check_and_set(&self) -> bool {
        true
    }

    /// Scans for cells the sweeper should examine: cells with more than
    /// one stored version, or whose newest version is a tombstone.
    ///
    /// The scan always finishes the row it is in before honoring the
    /// request limits, so consecutive requests starting from
    /// `next_start_row` advance by at least one full row and never
    /// revisit a cell.
    ///
    /// # Errors
    ///
    /// `TableNotFound` or `InvalidArgument` for zero limits.
    fn get_candidate_cells(
        &self,
        table: &TableRef,
        request: &CandidateCellsRequest,
    ) -> MeridianResult<CandidateBatch>;
}

/// Validates one write against the cell and value size limits.
///
/// # Errors
///
/// `CellNameTooLarge` or `ValueTooLarge`.
pub fn validate_write(cell: &Cell, value: &Value) -> MeridianResult<()> {
    let name_size = cell.name_size();
    if name_size > MAX_CELL_NAME_SIZE {
        return Err(MeridianError::CellNameTooLarge {
            size: name_size,
            max_size: MAX_CELL_NAME_SIZE,
        });
    }
    if value.len() > MAX_VALUE_SIZE {
        return Err(MeridianError::ValueTooLarge {
            size: value.len(),
            max_size: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}
