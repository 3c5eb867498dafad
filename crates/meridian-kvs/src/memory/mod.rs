//! In-memory key-value engine.
//!
//! The engine keeps tables as ordered maps of cells, each cell holding
//! an ordered map of versions. A single reader-writer lock over the
//! table map is enough here: the production path batches work well
//! above this layer, and tests want predictable interleavings more
//! than raw throughput.
//!
//! Check-and-set executes its whole plan under the write lock, which
//! gives the batch atomicity the trait demands for free.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use meridian_common::error::{MeridianError, MeridianResult};
use meridian_common::types::{Cell, TableRef, Timestamp, Value};
use meridian_common::CAS_CELL_TIMESTAMP;
use parking_lot::RwLock;
use tracing::debug;

use crate::api::{
    validate_write, CandidateBatch, CandidateCell, CandidateCellsRequest, CheckAndSetRequest,
    KeyValueService, TableSchema, VersionedValue,
};
use crate::cas::{plan_check_and_set, CasCondition};

/// Versions of one cell, keyed by raw timestamp.
type VersionMap = BTreeMap<u64, Value>;

#[derive(Debug)]
struct TableData {
    schema: TableSchema,
    cells: BTreeMap<Cell, VersionMap>,
}

impl TableData {
    fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            cells: BTreeMap::new(),
        }
    }
}

/// Operation counters for one engine instance.
#[derive(Debug, Default)]
pub struct KvsStats {
    gets: AtomicU64,
    puts: AtomicU64,
    deletes: AtomicU64,
    cas_successes: AtomicU64,
    cas_failures: AtomicU64,
}

impl KvsStats {
    fn record_get(&self) {
        self.gets.fetch_add(1, Ordering::Relaxed);
    }

    fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    fn record_cas(&self, success: bool) {
        if success {
            self.cas_successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cas_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of point reads served.
    pub fn gets(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    /// Number of put batches applied.
    pub fn puts(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    /// Number of version deletions applied.
    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    /// Number of check-and-set requests that applied.
    pub fn cas_successes(&self) -> u64 {
        self.cas_successes.load(Ordering::Relaxed)
    }

    /// Number of check-and-set requests that failed their condition.
    pub fn cas_failures(&self) -> u64 {
        self.cas_failures.load(Ordering::Relaxed)
    }
}

/// A [`KeyValueService`] backed by process memory.
///
/// Supports the full trait surface including check-and-set, so it can
/// stand in for a production store in tests and single-node setups.
pub struct InMemoryKeyValueService {
    tables: RwLock<BTreeMap<TableRef, TableData>>,
    stats: KvsStats,
}

impl InMemoryKeyValueService {
    /// Creates an empty engine with no tables.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(BTreeMap::new()),
            stats: KvsStats::default(),
        }
    }

    /// Operation counters for this engine.
    pub fn stats(&self) -> &KvsStats {
        &self.stats
    }
}

impl Default for InMemoryKeyValueService {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueService for InMemoryKeyValueService {
    fn create_table(&self, table: &TableRef, schema: &TableSchema) -> MeridianResult<()> {
        let mut tables = self.tables.write();
        if let Some(existing) = tables.get(table) {
            if existing.schema == *schema {
                return Ok(());
            }
            return Err(MeridianError::invalid_argument(format!(
                "table {table} already exists with a different schema"
            )));
        }
        debug!(table = %table, "created table");
        tables.insert(table.clone(), TableData::new(*schema));
        Ok(())
    }

    fn table_exists(&self, table: &TableRef) -> bool {
        self.tables.read().contains_key(table)
    }

    fn get_table_schema(&self, table: &TableRef) -> MeridianResult<TableSchema> {
        self.tables
            .read()
            .get(table)
            .map(|data| data.schema)
            .ok_or_else(|| MeridianError::table_not_found(table))
    }

    fn get_all_table_names(&self) -> Vec<TableRef> {
        self.tables.read().keys().cloned().collect()
    }

    fn get(
        &self,
        table: &TableRef,
        cell: &Cell,
        max_ts: Timestamp,
    ) -> MeridianResult<Option<VersionedValue>> {
        self.stats.record_get();
        let tables = self.tables.read();
        let data = tables
            .get(table)
            .ok_or_else(|| MeridianError::table_not_found(table))?;

        let Some(versions) = data.cells.get(cell) else {
            return Ok(None);
        };
        Ok(versions
            .range(..=max_ts.as_u64())
            .next_back()
            .map(|(&ts, value)| VersionedValue::new(value.clone(), Timestamp::new(ts))))
    }

    fn put(&self, table: &TableRef, writes: &[(Cell, Value)], ts: Timestamp) -> MeridianResult<()> {
        for (cell, value) in writes {
            validate_write(cell, value)?;
        }
        self.stats.record_put();

        let mut tables = self.tables.write();
        let data = tables
            .get_mut(table)
            .ok_or_else(|| MeridianError::table_not_found(table))?;
        for (cell, value) in writes {
            data.cells
                .entry(cell.clone())
                .or_default()
                .insert(ts.as_u64(), value.clone());
        }
        Ok(())
    }

    fn delete(&self, table: &TableRef, cell: &Cell, ts: Timestamp) -> MeridianResult<()> {
        self.stats.record_delete();
        let mut tables = self.tables.write();
        let data = tables
            .get_mut(table)
            .ok_or_else(|| MeridianError::table_not_found(table))?;

        if let Some(versions) = data.cells.get_mut(cell) {
            versions.remove(&ts.as_u64());
            if versions.is_empty() {
                data.cells.remove(cell);
            }
        }
        Ok(())
    }

    fn get_all_timestamps(&self, table: &TableRef, cell: &Cell) -> MeridianResult<Vec<Timestamp>> {
        let tables = self.tables.read();
        let data = tables
            .get(table)
            .ok_or_else(|| MeridianError::table_not_found(table))?;

        Ok(data
            .cells
            .get(cell)
            .map(|versions| versions.keys().map(|&ts| Timestamp::new(ts)).collect())
            .unwrap_or_default())
    }

    fn check_and_set(&self, request: &CheckAndSetRequest) -> MeridianResult<()> {
        let plan = plan_check_and_set(request)?;

        let mut tables = self.tables.write();
        let data = tables
            .get_mut(&request.table)
            .ok_or_else(|| MeridianError::table_not_found(&request.table))?;

        for op in plan.ops() {
            let current = data
                .cells
                .get(&op.cell)
                .and_then(|versions| versions.get(&CAS_CELL_TIMESTAMP));
            let holds = match (&op.condition, current) {
                (CasCondition::AbsenceExpected, None) => true,
                (CasCondition::ValueEqual(expected), Some(actual)) => expected == actual,
                _ => false,
            };
            if !holds {
                self.stats.record_cas(false);
                debug!(table = %request.table, cell = ?op.cell, "check and set condition failed");
                return Err(MeridianError::cas_failed(&request.table));
            }
        }

        for op in plan.ops() {
            data.cells
                .entry(op.cell.clone())
                .or_default()
                .insert(CAS_CELL_TIMESTAMP, op.new_value.clone());
        }
        self.stats.record_cas(true);
        Ok(())
    }

    fn get_candidate_cells(
        &self,
        table: &TableRef,
        request: &CandidateCellsRequest,
    ) -> MeridianResult<CandidateBatch> {
        if request.candidate_batch_size == 0 || request.max_cell_ts_pairs == 0 {
            return Err(MeridianError::invalid_argument(
                "candidate scan limits must be at least 1",
            ));
        }

        let tables = self.tables.read();
        let data = tables
            .get(table)
            .ok_or_else(|| MeridianError::table_not_found(table))?;

        let lower_bound = match &request.start_row {
            Some(row) => Cell::new(row.clone(), bytes::Bytes::new()),
            None => Cell::new(bytes::Bytes::new(), bytes::Bytes::new()),
        };

        let mut candidates = Vec::new();
        let mut pairs_examined = 0;
        let mut next_start_row = None;

        let mut iter = data.cells.range(lower_bound..).peekable();
        while let Some((cell, versions)) = iter.next() {
            pairs_examined += versions.len();
            let latest_empty = versions
                .last_key_value()
                .is_some_and(|(_, value)| value.is_tombstone());
            if versions.len() > 1 || latest_empty {
                candidates.push(CandidateCell {
                    cell: cell.clone(),
                    timestamps: versions.keys().map(|&ts| Timestamp::new(ts)).collect(),
                    latest_value_empty: latest_empty,
                });
            }

            // Limits apply at row boundaries only, so a resumed scan
            // never lands in the middle of a row.
            let row_finished = match iter.peek() {
                Some((next_cell, _)) => next_cell.row() != cell.row(),
                None => true,
            };
            if row_finished
                && (candidates.len() >= request.candidate_batch_size
                    || pairs_examined >= request.max_cell_ts_pairs)
            {
                if iter.peek().is_some() {
                    next_start_row = Some(cell.row_successor());
                }
                break;
            }
        }

        Ok(CandidateBatch {
            candidates,
            next_start_row,
            cell_ts_pairs_examined: pairs_examined,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ColumnUpdate, ConflictHandler, SweepStrategy};
    use bytes::Bytes;

    fn new_table(kvs: &InMemoryKeyValueService, name: &str) -> TableRef {
        let table = TableRef::create("test", name).unwrap();
        kvs.create_table(&table, &TableSchema::default()).unwrap();
        table
    }

    fn put_one(kvs: &InMemoryKeyValueService, table: &TableRef, cell: &Cell, value: &[u8], ts: u64) {
        kvs.put(
            table,
            &[(cell.clone(), Value::from_bytes(value))],
            Timestamp::new(ts),
        )
        .unwrap();
    }

    #[test]
    fn test_get_returns_newest_version_at_or_below_bound() {
        let kvs = InMemoryKeyValueService::new();
        let table = new_table(&kvs, "t");
        let cell = Cell::new("r", "c");

        put_one(&kvs, &table, &cell, b"v10", 10);
        put_one(&kvs, &table, &cell, b"v20", 20);

        assert!(kvs.get(&table, &cell, Timestamp::new(9)).unwrap().is_none());

        let at_10 = kvs.get(&table, &cell, Timestamp::new(10)).unwrap().unwrap();
        assert_eq!(at_10.value.as_bytes(), b"v10");
        assert_eq!(at_10.ts, Timestamp::new(10));

        let at_15 = kvs.get(&table, &cell, Timestamp::new(15)).unwrap().unwrap();
        assert_eq!(at_15.value.as_bytes(), b"v10");

        let at_25 = kvs.get(&table, &cell, Timestamp::new(25)).unwrap().unwrap();
        assert_eq!(at_25.value.as_bytes(), b"v20");
        assert_eq!(at_25.ts, Timestamp::new(20));
    }

    #[test]
    fn test_tombstones_read_like_values() {
        let kvs = InMemoryKeyValueService::new();
        let table = new_table(&kvs, "t");
        let cell = Cell::new("r", "c");

        put_one(&kvs, &table, &cell, b"v", 10);
        kvs.put(&table, &[(cell.clone(), Value::tombstone())], Timestamp::new(20))
            .unwrap();

        let read = kvs.get(&table, &cell, Timestamp::new(30)).unwrap().unwrap();
        assert!(read.value.is_tombstone());
        assert_eq!(read.ts, Timestamp::new(20));
    }

    #[test]
    fn test_put_replaces_same_version() {
        let kvs = InMemoryKeyValueService::new();
        let table = new_table(&kvs, "t");
        let cell = Cell::new("r", "c");

        put_one(&kvs, &table, &cell, b"first", 10);
        put_one(&kvs, &table, &cell, b"second", 10);

        let read = kvs.get(&table, &cell, Timestamp::new(10)).unwrap().unwrap();
        assert_eq!(read.value.as_bytes(), b"second");
        assert_eq!(kvs.get_all_timestamps(&table, &cell).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_removes_exact_version_and_is_idempotent() {
        let kvs = InMemoryKeyValueService::new();
        let table = new_table(&kvs, "t");
        let cell = Cell::new("r", "c");

        put_one(&kvs, &table, &cell, b"v10", 10);
        put_one(&kvs, &table, &cell, b"v20", 20);

        kvs.delete(&table, &cell, Timestamp::new(10)).unwrap();
        kvs.delete(&table, &cell, Timestamp::new(10)).unwrap();

        let tags = kvs.get_all_timestamps(&table, &cell).unwrap();
        assert_eq!(tags, vec![Timestamp::new(20)]);

        kvs.delete(&table, &cell, Timestamp::new(20)).unwrap();
        assert!(kvs.get_all_timestamps(&table, &cell).unwrap().is_empty());
    }

    #[test]
    fn test_get_all_timestamps_ascending() {
        let kvs = InMemoryKeyValueService::new();
        let table = new_table(&kvs, "t");
        let cell = Cell::new("r", "c");

        put_one(&kvs, &table, &cell, b"c", 30);
        put_one(&kvs, &table, &cell, b"a", 10);
        put_one(&kvs, &table, &cell, b"b", 20);

        let tags = kvs.get_all_timestamps(&table, &cell).unwrap();
        assert_eq!(
            tags,
            vec![Timestamp::new(10), Timestamp::new(20), Timestamp::new(30)]
        );
    }

    #[test]
    fn test_missing_table_errors() {
        let kvs = InMemoryKeyValueService::new();
        let table = TableRef::create("test", "missing").unwrap();
        let cell = Cell::new("r", "c");

        let err = kvs.get(&table, &cell, Timestamp::new(1)).unwrap_err();
        assert!(matches!(err, MeridianError::TableNotFound { .. }));
        let err = kvs
            .put(&table, &[(cell.clone(), Value::from_bytes(b"v"))], Timestamp::new(1))
            .unwrap_err();
        assert!(matches!(err, MeridianError::TableNotFound { .. }));
        assert!(!kvs.table_exists(&table));
    }

    #[test]
    fn test_create_table_idempotent_only_for_identical_schema() {
        let kvs = InMemoryKeyValueService::new();
        let table = TableRef::create("test", "t").unwrap();
        let schema = TableSchema::default();

        kvs.create_table(&table, &schema).unwrap();
        kvs.create_table(&table, &schema).unwrap();

        let other = TableSchema::new(ConflictHandler::IgnoreAll, SweepStrategy::Nothing);
        let err = kvs.create_table(&table, &other).unwrap_err();
        assert!(matches!(err, MeridianError::InvalidArgument { .. }));
        assert_eq!(kvs.get_table_schema(&table).unwrap(), schema);
    }

    #[test]
    fn test_cas_insert_if_not_exists() {
        let kvs = InMemoryKeyValueService::new();
        let table = new_table(&kvs, "t");
        let cell = Cell::new("r", "c");

        let insert = CheckAndSetRequest::new_cell(table.clone(), &cell, Value::from_bytes(b"v1"));
        kvs.check_and_set(&insert).unwrap();

        let err = kvs.check_and_set(&insert).unwrap_err();
        assert!(matches!(err, MeridianError::CheckAndSetFailed { .. }));
        assert!(err.is_retryable());

        let read = kvs.get(&table, &cell, Timestamp::MAX).unwrap().unwrap();
        assert_eq!(read.value.as_bytes(), b"v1");
        assert_eq!(read.ts.as_u64(), CAS_CELL_TIMESTAMP);
    }

    #[test]
    fn test_cas_update_if_equal() {
        let kvs = InMemoryKeyValueService::new();
        let table = new_table(&kvs, "t");
        let cell = Cell::new("r", "c");

        kvs.check_and_set(&CheckAndSetRequest::new_cell(
            table.clone(),
            &cell,
            Value::from_bytes(b"v1"),
        ))
        .unwrap();

        kvs.check_and_set(&CheckAndSetRequest::update_cell(
            table.clone(),
            &cell,
            Value::from_bytes(b"v1"),
            Value::from_bytes(b"v2"),
        ))
        .unwrap();

        let stale = CheckAndSetRequest::update_cell(
            table.clone(),
            &cell,
            Value::from_bytes(b"v1"),
            Value::from_bytes(b"v3"),
        );
        assert!(kvs.check_and_set(&stale).is_err());

        let read = kvs.get(&table, &cell, Timestamp::MAX).unwrap().unwrap();
        assert_eq!(read.value.as_bytes(), b"v2");
    }

    #[test]
    fn test_cas_batch_applies_all_or_nothing() {
        let kvs = InMemoryKeyValueService::new();
        let table = new_table(&kvs, "t");

        let batch = CheckAndSetRequest {
            table: table.clone(),
            row: Bytes::from_static(b"r"),
            updates: vec![
                ColumnUpdate {
                    column: Bytes::from_static(b"a"),
                    expected: None,
                    new_value: Value::from_bytes(b"1"),
                },
                ColumnUpdate {
                    column: Bytes::from_static(b"b"),
                    // Fails: nothing stored yet.
                    expected: Some(Value::from_bytes(b"x")),
                    new_value: Value::from_bytes(b"2"),
                },
            ],
        };
        assert!(kvs.check_and_set(&batch).is_err());

        // First column must not have been applied.
        let cell_a = Cell::new("r", "a");
        assert!(kvs.get(&table, &cell_a, Timestamp::MAX).unwrap().is_none());

        let both_new = CheckAndSetRequest {
            table: table.clone(),
            row: Bytes::from_static(b"r"),
            updates: vec![
                ColumnUpdate {
                    column: Bytes::from_static(b"a"),
                    expected: None,
                    new_value: Value::from_bytes(b"1"),
                },
                ColumnUpdate {
                    column: Bytes::from_static(b"b"),
                    expected: None,
                    new_value: Value::from_bytes(b"2"),
                },
            ],
        };
        kvs.check_and_set(&both_new).unwrap();
        assert!(kvs.get(&table, &cell_a, Timestamp::MAX).unwrap().is_some());
    }

    #[test]
    fn test_candidate_scan_selects_multi_version_and_tombstone_cells() {
        let kvs = InMemoryKeyValueService::new();
        let table = new_table(&kvs, "t");

        let single = Cell::new("r1", "a");
        put_one(&kvs, &table, &single, b"v", 10);

        let multi = Cell::new("r1", "b");
        put_one(&kvs, &table, &multi, b"v1", 10);
        put_one(&kvs, &table, &multi, b"v2", 20);

        let deleted = Cell::new("r2", "a");
        kvs.put(
            &table,
            &[(deleted.clone(), Value::tombstone())],
            Timestamp::new(30),
        )
        .unwrap();

        let batch = kvs
            .get_candidate_cells(
                &table,
                &CandidateCellsRequest {
                    start_row: None,
                    candidate_batch_size: 100,
                    max_cell_ts_pairs: 1000,
                },
            )
            .unwrap();

        assert_eq!(batch.candidates.len(), 2);
        assert_eq!(batch.candidates[0].cell, multi);
        assert_eq!(
            batch.candidates[0].timestamps,
            vec![Timestamp::new(10), Timestamp::new(20)]
        );
        assert!(!batch.candidates[0].latest_value_empty);
        assert_eq!(batch.candidates[1].cell, deleted);
        assert!(batch.candidates[1].latest_value_empty);
        assert!(batch.next_start_row.is_none());
        assert_eq!(batch.cell_ts_pairs_examined, 4);
    }

    #[test]
    fn test_candidate_scan_resumes_at_row_boundaries() {
        let kvs = InMemoryKeyValueService::new();
        let table = new_table(&kvs, "t");

        for row in [&b"r1"[..], b"r2", b"r3"] {
            let cell = Cell::new(row, &b"c"[..]);
            put_one(&kvs, &table, &cell, b"v1", 10);
            put_one(&kvs, &table, &cell, b"v2", 20);
        }

        let first = kvs
            .get_candidate_cells(
                &table,
                &CandidateCellsRequest {
                    start_row: None,
                    candidate_batch_size: 1,
                    max_cell_ts_pairs: 1000,
                },
            )
            .unwrap();
        assert_eq!(first.candidates.len(), 1);
        assert_eq!(first.candidates[0].cell.row(), b"r1");
        let resume = first.next_start_row.expect("more rows to scan");

        let second = kvs
            .get_candidate_cells(
                &table,
                &CandidateCellsRequest {
                    start_row: Some(resume),
                    candidate_batch_size: 10,
                    max_cell_ts_pairs: 1000,
                },
            )
            .unwrap();
        assert_eq!(second.candidates.len(), 2);
        assert_eq!(second.candidates[0].cell.row(), b"r2");
        assert_eq!(second.candidates[1].cell.row(), b"r3");
        assert!(second.next_start_row.is_none());
    }

    #[test]
    fn test_candidate_scan_finishes_row_before_stopping() {
        let kvs = InMemoryKeyValueService::new();
        let table = new_table(&kvs, "t");

        // Row r1 holds two candidate cells; a batch size of 1 must
        // still return both before stopping.
        for col in [&b"a"[..], b"b"] {
            let cell = Cell::new(&b"r1"[..], col);
            put_one(&kvs, &table, &cell, b"v1", 10);
            put_one(&kvs, &table, &cell, b"v2", 20);
        }
        let r2 = Cell::new("r2", "a");
        put_one(&kvs, &table, &r2, b"v1", 10);
        put_one(&kvs, &table, &r2, b"v2", 20);

        let batch = kvs
            .get_candidate_cells(
                &table,
                &CandidateCellsRequest {
                    start_row: None,
                    candidate_batch_size: 1,
                    max_cell_ts_pairs: 1000,
                },
            )
            .unwrap();
        assert_eq!(batch.candidates.len(), 2);
        assert!(batch.candidates.iter().all(|c| c.cell.row() == b"r1"));
        assert!(batch.next_start_row.is_some());
    }

    #[test]
    fn test_candidate_scan_rejects_zero_limits() {
        let kvs = InMemoryKeyValueService::new();
        let table = new_table(&kvs, "t");

        let err = kvs
            .get_candidate_cells(
                &table,
                &CandidateCellsRequest {
                    start_row: None,
                    candidate_batch_size: 0,
                    max_cell_ts_pairs: 100,
                },
            )
            .unwrap_err();
        assert!(matches!(err, MeridianError::InvalidArgument { .. }));
    }

    #[test]
    fn test_stats_count_operations() {
        let kvs = InMemoryKeyValueService::new();
        let table = new_table(&kvs, "t");
        let cell = Cell::new("r", "c");

        put_one(&kvs, &table, &cell, b"v", 10);
        let _ = kvs.get(&table, &cell, Timestamp::MAX).unwrap();
        let _ = kvs.check_and_set(&CheckAndSetRequest::new_cell(
            table.clone(),
            &cell,
            Value::from_bytes(b"c"),
        ));

        assert_eq!(kvs.stats().puts(), 1);
        assert_eq!(kvs.stats().gets(), 1);
        assert_eq!(kvs.stats().cas_successes(), 1);
    }
}
