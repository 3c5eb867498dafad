//! The sweep task runner.
//!
//! One run processes one candidate batch of one table: it classifies
//! every candidate cell's versions against the sweep watermark and
//! deletes the versions no current or future transaction can ever
//! read. The watermark is recomputed immediately before every delete
//! batch, so a long run never deletes against a stale bound.
//!
//! Safety rests on two facts. Versions at or above the watermark are
//! never touched, so open snapshots keep everything they might read.
//! And below the watermark no writer can still be alive, so an
//! in-flight version found there belongs to a crashed transaction and
//! is fenced before being judged.

use std::sync::Arc;

use bytes::Bytes;
use meridian_common::types::{Cell, TableRef, Timestamp};
use meridian_common::{
    MeridianResult, DEFAULT_SWEEP_CANDIDATE_BATCH_SIZE, DEFAULT_SWEEP_DELETE_BATCH_SIZE,
    DEFAULT_SWEEP_READ_LIMIT,
};
use meridian_kvs::{CandidateCell, CandidateCellsRequest, KeyValueService, SweepStrategy};
use meridian_txn::{SweepStrategyManager, TransactionService, WatermarkSource};
use tracing::debug;

/// Batch limits for one sweep run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepBatchConfig {
    /// Budget of cell/version pairs examined.
    pub max_cell_ts_pairs_to_examine: usize,
    /// Candidate cells fetched per run.
    pub candidate_batch_size: usize,
    /// Versions deleted per mutation batch.
    pub delete_batch_size: usize,
}

impl Default for SweepBatchConfig {
    fn default() -> Self {
        Self {
            max_cell_ts_pairs_to_examine: DEFAULT_SWEEP_READ_LIMIT,
            candidate_batch_size: DEFAULT_SWEEP_CANDIDATE_BATCH_SIZE,
            delete_batch_size: DEFAULT_SWEEP_DELETE_BATCH_SIZE,
        }
    }
}

/// What one sweep run accomplished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Cell/version pairs the scan looked at.
    pub cell_ts_pairs_examined: u64,
    /// Versions deleted.
    pub cell_ts_pairs_deleted: u64,
    /// Row to resume from; `None` when the table is done.
    pub next_start_row: Option<Bytes>,
}

impl SweepOutcome {
    /// A run that had nothing to do.
    #[must_use]
    pub fn nothing() -> Self {
        Self {
            cell_ts_pairs_examined: 0,
            cell_ts_pairs_deleted: 0,
            next_start_row: None,
        }
    }

    /// Whether another run is needed to finish the table.
    #[must_use]
    pub fn more_to_sweep(&self) -> bool {
        self.next_start_row.is_some()
    }
}

/// Deletes exact versions from a table.
pub struct CellsSweeper {
    kvs: Arc<dyn KeyValueService>,
}

impl CellsSweeper {
    /// Creates a sweeper over the store.
    #[must_use]
    pub fn new(kvs: Arc<dyn KeyValueService>) -> Self {
        Self { kvs }
    }

    /// Deletes every `(cell, version)` pair. Pairs already gone are
    /// skipped by the store, so a retried batch is harmless.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub fn sweep_cells(
        &self,
        table: &TableRef,
        pairs: &[(Cell, Timestamp)],
    ) -> MeridianResult<u64> {
        for (cell, ts) in pairs {
            self.kvs.delete(table, cell, *ts)?;
        }
        Ok(pairs.len() as u64)
    }
}

/// Runs single sweep batches against one table at a time.
pub struct SweepTaskRunner {
    kvs: Arc<dyn KeyValueService>,
    transactions: Arc<TransactionService>,
    strategies: Arc<SweepStrategyManager>,
    watermarks: Arc<dyn WatermarkSource>,
    sweeper: CellsSweeper,
}

impl SweepTaskRunner {
    /// Wires a runner over the shared services.
    #[must_use]
    pub fn new(
        kvs: Arc<dyn KeyValueService>,
        transactions: Arc<TransactionService>,
        strategies: Arc<SweepStrategyManager>,
        watermarks: Arc<dyn WatermarkSource>,
    ) -> Self {
        let sweeper = CellsSweeper::new(Arc::clone(&kvs));
        Self {
            kvs,
            transactions,
            strategies,
            watermarks,
            sweeper,
        }
    }

    /// Sweeps one batch of `table` starting at `start_row`.
    ///
    /// # Errors
    ///
    /// Storage errors; a `Nothing` strategy yields an empty outcome
    /// rather than an error.
    pub fn run(
        &self,
        table: &TableRef,
        start_row: Option<Bytes>,
        config: &SweepBatchConfig,
    ) -> MeridianResult<SweepOutcome> {
        let strategy = self.strategies.sweep_strategy(table)?;
        if strategy == SweepStrategy::Nothing {
            return Ok(SweepOutcome::nothing());
        }

        let batch = self.kvs.get_candidate_cells(
            table,
            &CandidateCellsRequest {
                start_row,
                candidate_batch_size: config.candidate_batch_size,
                max_cell_ts_pairs: config.max_cell_ts_pairs_to_examine,
            },
        )?;

        let mut deleted = 0u64;
        let mut pending: Vec<(Cell, Timestamp)> = Vec::new();
        let mut watermark = self.watermarks.sweep_watermark()?;

        for candidate in &batch.candidates {
            let sweepable = self.classify(strategy, candidate, watermark)?;
            pending.extend(
                sweepable
                    .into_iter()
                    .map(|ts| (candidate.cell.clone(), ts)),
            );
            while pending.len() >= config.delete_batch_size {
                let chunk: Vec<_> = pending.drain(..config.delete_batch_size).collect();
                deleted += self.sweeper.sweep_cells(table, &chunk)?;
                // Refresh the bound for the classifications still ahead.
                watermark = self.watermarks.sweep_watermark()?;
            }
        }
        if !pending.is_empty() {
            deleted += self.sweeper.sweep_cells(table, &pending)?;
        }

        debug!(
            table = %table.qualified_name(),
            examined = batch.cell_ts_pairs_examined,
            deleted,
            done = batch.next_start_row.is_none(),
            "sweep batch finished"
        );
        Ok(SweepOutcome {
            cell_ts_pairs_examined: batch.cell_ts_pairs_examined as u64,
            cell_ts_pairs_deleted: deleted,
            next_start_row: batch.next_start_row,
        })
    }

    /// Splits a candidate's versions into sweepable and retained.
    ///
    /// Walking tags newest-first below the watermark: the newest tag
    /// that committed below the watermark is retained, and everything
    /// older goes. Versions whose commit straddles the watermark are
    /// kept; aborted versions go regardless. `Thorough` also drops the
    /// retained version when it is the cell's newest version overall
    /// and a delete tombstone.
    fn classify(
        &self,
        strategy: SweepStrategy,
        candidate: &CandidateCell,
        watermark: Timestamp,
    ) -> MeridianResult<Vec<Timestamp>> {
        let Some(&newest) = candidate.timestamps.last() else {
            return Ok(Vec::new());
        };

        let mut sweepable = Vec::new();
        let mut retained: Option<Timestamp> = None;
        for &tag in candidate.timestamps.iter().rev() {
            // The reserved CAS slot is not transactional data.
            if tag.is_zero() || tag >= watermark {
                continue;
            }
            if retained.is_some() {
                // No open or future snapshot can ever walk below the
                // retained version.
                sweepable.push(tag);
                continue;
            }
            match self.resolve(tag)? {
                None => sweepable.push(tag),
                Some(commit_ts) if commit_ts < watermark => retained = Some(tag),
                Some(_) => {}
            }
        }

        if strategy == SweepStrategy::Thorough {
            if let Some(tag) = retained {
                if tag == newest && candidate.latest_value_empty {
                    sweepable.push(tag);
                }
            }
        }
        Ok(sweepable)
    }

    /// The commit timestamp of a version's writer, fencing writers
    /// whose record never appeared. `None` means aborted.
    ///
    /// Only called for tags below the watermark, where no live writer
    /// can exist, so fencing needs no grace period.
    fn resolve(&self, tag: Timestamp) -> MeridianResult<Option<Timestamp>> {
        match self.transactions.get_commit_state(tag)? {
            Some(state) => Ok(state.commit_timestamp()),
            None => Ok(self.transactions.abort(tag)?.commit_timestamp()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_common::types::Value;
    use meridian_kvs::{InMemoryKeyValueService, TableSchema};
    use meridian_txn::CommitState;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FixedWatermark(AtomicU64);

    impl FixedWatermark {
        fn at(ts: u64) -> Arc<Self> {
            Arc::new(Self(AtomicU64::new(ts)))
        }

        fn set(&self, ts: u64) {
            self.0.store(ts, Ordering::SeqCst);
        }
    }

    impl WatermarkSource for FixedWatermark {
        fn unreadable_timestamp(&self) -> MeridianResult<Timestamp> {
            Ok(Timestamp::new(self.0.load(Ordering::SeqCst)))
        }

        fn immutable_timestamp(&self) -> MeridianResult<Timestamp> {
            self.unreadable_timestamp()
        }
    }

    struct Fixture {
        kvs: Arc<InMemoryKeyValueService>,
        transactions: Arc<TransactionService>,
        watermark: Arc<FixedWatermark>,
        runner: SweepTaskRunner,
        table: TableRef,
    }

    fn fixture(schema: TableSchema, watermark: u64) -> Fixture {
        let kvs = Arc::new(InMemoryKeyValueService::new());
        let shared: Arc<dyn KeyValueService> = Arc::clone(&kvs) as _;
        let transactions = Arc::new(TransactionService::create(Arc::clone(&shared)).unwrap());
        let strategies = Arc::new(SweepStrategyManager::new(Arc::clone(&shared)));
        let source = FixedWatermark::at(watermark);
        let runner = SweepTaskRunner::new(
            Arc::clone(&shared),
            Arc::clone(&transactions),
            strategies,
            Arc::clone(&source) as Arc<dyn WatermarkSource>,
        );
        let table = TableRef::create("test", "t").unwrap();
        kvs.create_table(&table, &schema).unwrap();
        Fixture {
            kvs,
            transactions,
            watermark: source,
            runner,
            table,
        }
    }

    fn cell() -> Cell {
        Cell::new(&b"r"[..], &b"c"[..])
    }

    /// Writes a committed version: data at `start`, record start→commit.
    fn commit_version(f: &Fixture, cell: &Cell, start: u64, commit: u64, value: &[u8]) {
        f.kvs
            .put(
                &f.table,
                &[(cell.clone(), Value::from_bytes(value))],
                Timestamp::new(start),
            )
            .unwrap();
        f.transactions
            .put_unless_exists(Timestamp::new(start), Timestamp::new(commit))
            .unwrap();
    }

    fn versions(f: &Fixture, cell: &Cell) -> Vec<u64> {
        f.kvs
            .get_all_timestamps(&f.table, cell)
            .unwrap()
            .into_iter()
            .map(Timestamp::as_u64)
            .collect()
    }

    #[test]
    fn test_conservative_retains_newest_committed_below_watermark() {
        let f = fixture(TableSchema::default(), 100);
        commit_version(&f, &cell(), 10, 11, b"v1");
        commit_version(&f, &cell(), 20, 21, b"v2");
        commit_version(&f, &cell(), 30, 31, b"v3");

        let outcome = f
            .runner
            .run(&f.table, None, &SweepBatchConfig::default())
            .unwrap();

        assert_eq!(outcome.cell_ts_pairs_deleted, 2);
        assert!(!outcome.more_to_sweep());
        assert_eq!(versions(&f, &cell()), vec![30]);
    }

    #[test]
    fn test_versions_above_watermark_are_untouched() {
        let f = fixture(TableSchema::default(), 25);
        commit_version(&f, &cell(), 10, 11, b"v1");
        commit_version(&f, &cell(), 20, 21, b"v2");
        commit_version(&f, &cell(), 30, 31, b"v3");

        f.runner
            .run(&f.table, None, &SweepBatchConfig::default())
            .unwrap();

        // 20 is retained (newest commit below 25); 30 is above the
        // watermark; only 10 goes.
        assert_eq!(versions(&f, &cell()), vec![20, 30]);
    }

    #[test]
    fn test_commit_straddling_the_watermark_is_kept() {
        // Writer started below the watermark but committed above it; an
        // open snapshot between the two may still need the version.
        let f = fixture(TableSchema::default(), 25);
        commit_version(&f, &cell(), 10, 11, b"v1");
        commit_version(&f, &cell(), 20, 40, b"v2");

        f.runner
            .run(&f.table, None, &SweepBatchConfig::default())
            .unwrap();

        assert_eq!(versions(&f, &cell()), vec![10, 20]);
    }

    #[test]
    fn test_aborted_versions_are_removed() {
        let f = fixture(TableSchema::default(), 100);
        commit_version(&f, &cell(), 10, 11, b"v1");
        f.kvs
            .put(
                &f.table,
                &[(cell(), Value::from_bytes(b"junk"))],
                Timestamp::new(20),
            )
            .unwrap();
        f.transactions.abort(Timestamp::new(20)).unwrap();

        let outcome = f
            .runner
            .run(&f.table, None, &SweepBatchConfig::default())
            .unwrap();

        assert_eq!(outcome.cell_ts_pairs_deleted, 1);
        assert_eq!(versions(&f, &cell()), vec![10]);
    }

    #[test]
    fn test_in_flight_below_watermark_is_fenced_and_removed() {
        let f = fixture(TableSchema::default(), 100);
        commit_version(&f, &cell(), 10, 11, b"v1");
        // Data written but no commit record: a crashed writer.
        f.kvs
            .put(
                &f.table,
                &[(cell(), Value::from_bytes(b"partial"))],
                Timestamp::new(20),
            )
            .unwrap();

        f.runner
            .run(&f.table, None, &SweepBatchConfig::default())
            .unwrap();

        assert_eq!(versions(&f, &cell()), vec![10]);
        assert_eq!(
            f.transactions
                .get_commit_state(Timestamp::new(20))
                .unwrap(),
            Some(CommitState::Aborted)
        );
    }

    #[test]
    fn test_conservative_keeps_a_latest_tombstone() {
        let f = fixture(TableSchema::default(), 100);
        commit_version(&f, &cell(), 10, 11, b"v1");
        commit_version(&f, &cell(), 20, 21, b"");

        f.runner
            .run(&f.table, None, &SweepBatchConfig::default())
            .unwrap();

        assert_eq!(versions(&f, &cell()), vec![20]);
    }

    #[test]
    fn test_thorough_removes_a_latest_tombstone() {
        let f = fixture(
            TableSchema::new(
                meridian_kvs::ConflictHandler::RetryOnWriteWrite,
                SweepStrategy::Thorough,
            ),
            100,
        );
        commit_version(&f, &cell(), 10, 11, b"v1");
        commit_version(&f, &cell(), 20, 21, b"");

        let outcome = f
            .runner
            .run(&f.table, None, &SweepBatchConfig::default())
            .unwrap();

        assert_eq!(outcome.cell_ts_pairs_deleted, 2);
        assert_eq!(versions(&f, &cell()), Vec::<u64>::new());
    }

    #[test]
    fn test_thorough_keeps_a_tombstone_with_newer_versions() {
        let f = fixture(
            TableSchema::new(
                meridian_kvs::ConflictHandler::RetryOnWriteWrite,
                SweepStrategy::Thorough,
            ),
            25,
        );
        commit_version(&f, &cell(), 10, 11, b"");
        commit_version(&f, &cell(), 30, 31, b"v2");

        f.runner
            .run(&f.table, None, &SweepBatchConfig::default())
            .unwrap();

        // The tombstone at 10 is retained: it is not the newest version
        // of the cell, so readers between 11 and 31 still need it.
        assert_eq!(versions(&f, &cell()), vec![10, 30]);
    }

    #[test]
    fn test_nothing_strategy_yields_empty_outcome() {
        let f = fixture(TableSchema::system(), 100);
        commit_version(&f, &cell(), 10, 11, b"v1");
        commit_version(&f, &cell(), 20, 21, b"v2");

        let outcome = f
            .runner
            .run(&f.table, None, &SweepBatchConfig::default())
            .unwrap();

        assert_eq!(outcome, SweepOutcome::nothing());
        assert_eq!(versions(&f, &cell()), vec![10, 20]);
    }

    #[test]
    fn test_watermark_refreshed_between_delete_batches() {
        let f = fixture(TableSchema::default(), 100);
        for row in 0..8u8 {
            let cell = Cell::new(vec![row], &b"c"[..]);
            let base = u64::from(row) * 10 + 1;
            commit_version(&f, &cell, base, base + 1, b"old");
            commit_version(&f, &cell, base + 2, base + 3, b"new");
        }

        // Tiny delete batches force several watermark recomputations.
        let config = SweepBatchConfig {
            delete_batch_size: 1,
            ..SweepBatchConfig::default()
        };
        f.watermark.set(100);
        let outcome = f.runner.run(&f.table, None, &config).unwrap();
        assert_eq!(outcome.cell_ts_pairs_deleted, 8);
    }

    #[test]
    fn test_open_transaction_keeps_its_snapshot_readable() {
        use meridian_common::types::ClientId;
        use meridian_common::LeadershipState;
        use meridian_lock::LockService;
        use meridian_timestamp::{InMemoryTimestampBoundStore, PersistentTimestampService};
        use meridian_txn::TransactionManager;

        let kvs = Arc::new(InMemoryKeyValueService::new());
        let shared: Arc<dyn KeyValueService> = Arc::clone(&kvs) as _;
        let leadership = Arc::new(LeadershipState::new());
        leadership.become_leader(1);
        let timestamps = Arc::new(
            PersistentTimestampService::create(
                Arc::new(InMemoryTimestampBoundStore::new()),
                Arc::clone(&leadership),
            )
            .unwrap(),
        );
        let locks = Arc::new(LockService::new(leadership));
        let manager = Arc::new(
            TransactionManager::create(
                Arc::clone(&shared),
                timestamps,
                locks,
                ClientId::new("test"),
            )
            .unwrap(),
        );

        let table = TableRef::create("test", "t").unwrap();
        kvs.create_table(&table, &TableSchema::default()).unwrap();
        let cell = cell();

        // Two committed versions, then a snapshot that sees the second.
        for value in [&b"v1"[..], b"v2"] {
            manager
                .run_with_retry(1, |txn| {
                    txn.put(&table, cell.clone(), Value::from_bytes(value))
                })
                .unwrap();
        }
        let reader = manager.begin().unwrap();

        let runner = SweepTaskRunner::new(
            Arc::clone(&shared),
            manager.transaction_service(),
            Arc::new(SweepStrategyManager::new(Arc::clone(&shared))),
            Arc::clone(&manager) as Arc<dyn WatermarkSource>,
        );
        runner
            .run(&table, None, &SweepBatchConfig::default())
            .unwrap();

        // Whatever the sweep removed, the open snapshot still reads its
        // value.
        assert_eq!(
            reader.get(&table, &cell).unwrap(),
            Some(Value::from_bytes(b"v2"))
        );
    }

    #[test]
    fn test_resumes_from_start_row() {
        let f = fixture(TableSchema::default(), 100);
        for row in [b"a", b"b"] {
            let cell = Cell::new(&row[..], &b"c"[..]);
            commit_version(&f, &cell, 10, 11, b"v1");
            commit_version(&f, &cell, 20, 21, b"v2");
        }

        let outcome = f
            .runner
            .run(&f.table, Some(Bytes::from_static(b"b")), &SweepBatchConfig::default())
            .unwrap();

        // Only row "b" was visited.
        assert_eq!(outcome.cell_ts_pairs_deleted, 1);
        assert_eq!(versions(&f, &Cell::new(&b"a"[..], &b"c"[..])), vec![10, 20]);
        assert_eq!(versions(&f, &Cell::new(&b"b"[..], &b"c"[..])), vec![20]);
    }
}
