//! Snapshot-isolated transactions.
//!
//! A transaction buffers writes locally and reads at a fixed snapshot:
//! the newest version of each cell whose writer committed at or before
//! this transaction's start timestamp. Nothing touches the store until
//! commit, which takes row locks, draws a commit timestamp, checks for
//! write-write conflicts, writes the buffered data at the start
//! timestamp, and finally publishes everything with one check-and-set
//! on the commit table.
//!
//! A version whose commit record never appears belongs to a stalled or
//! crashed writer. Readers wait briefly for it and then fence it with
//! the aborted sentinel; either the fence lands or the record shows up,
//! and the read proceeds on whichever truth won.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use meridian_common::types::{Cell, ClientId, LockToken, TableRef, Timestamp, Value};
use meridian_common::{
    MeridianError, MeridianResult, PENDING_COMMIT_RETRY_LIMIT, PENDING_COMMIT_RETRY_PAUSE_MS,
};
use meridian_kvs::{validate_write, ConflictHandler, KeyValueService};
use meridian_lock::{AcquireOutcome, LockDescriptor, LockRequest, LockService};
use meridian_timestamp::TimestampService;
use tracing::{debug, warn};

use crate::conflict::ConflictDetectionManager;
use crate::manager::{OpenGuard, TxnStats};
use crate::service::{CommitState, TransactionService};

/// Everything a transaction needs behind it.
pub(crate) struct TxnDeps {
    pub kvs: Arc<dyn KeyValueService>,
    pub transactions: Arc<TransactionService>,
    pub locks: Arc<LockService>,
    pub timestamps: Arc<dyn TimestampService>,
    pub conflicts: Arc<ConflictDetectionManager>,
    pub stats: Arc<TxnStats>,
}

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting reads and writes.
    Open,
    /// Commit in progress; no further operations accepted.
    Committing,
    /// Commit record published (or nothing to publish).
    Committed,
    /// Finalized as aborted.
    Aborted,
}

impl TransactionState {
    /// True for the two states a transaction can never leave.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Open => "open",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// A single snapshot-isolated transaction.
///
/// Obtained from a transaction manager. Reads see the snapshot at the
/// start timestamp plus this transaction's own buffered writes; writes
/// stay local until [`commit`] succeeds.
///
/// Dropping an open transaction aborts it.
///
/// [`commit`]: SnapshotTransaction::commit
pub struct SnapshotTransaction {
    deps: Arc<TxnDeps>,
    client: ClientId,
    start_ts: Timestamp,
    state: TransactionState,
    writes: HashMap<TableRef, BTreeMap<Cell, Value>>,
    // Dropped on reaching a terminal state, releasing the watermark.
    open_guard: Option<OpenGuard>,
}

impl SnapshotTransaction {
    pub(crate) fn new(
        deps: Arc<TxnDeps>,
        client: ClientId,
        start_ts: Timestamp,
        open_guard: Option<OpenGuard>,
    ) -> Self {
        Self {
            deps,
            client,
            start_ts,
            state: TransactionState::Open,
            writes: HashMap::new(),
            open_guard,
        }
    }

    /// The snapshot this transaction reads at.
    #[must_use]
    pub fn start_timestamp(&self) -> Timestamp {
        self.start_ts
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Reads a cell at this transaction's snapshot.
    ///
    /// A write buffered by this transaction shadows the store; a
    /// committed delete reads as `None`.
    ///
    /// # Errors
    ///
    /// `TransactionClosed` after commit or abort, otherwise storage
    /// errors.
    pub fn get(&self, table: &TableRef, cell: &Cell) -> MeridianResult<Option<Value>> {
        self.ensure_open()?;
        if let Some(buffered) = self.writes.get(table).and_then(|w| w.get(cell)) {
            if buffered.is_tombstone() {
                return Ok(None);
            }
            return Ok(Some(buffered.clone()));
        }
        self.read_committed(table, cell)
    }

    /// Buffers a write of `value` to `cell`.
    ///
    /// # Errors
    ///
    /// `TransactionClosed`, `CellNameTooLarge`, or `ValueTooLarge`.
    pub fn put(&mut self, table: &TableRef, cell: Cell, value: Value) -> MeridianResult<()> {
        self.ensure_open()?;
        validate_write(&cell, &value)?;
        self.writes
            .entry(table.clone())
            .or_default()
            .insert(cell, value);
        Ok(())
    }

    /// Buffers a delete of `cell`, written as the empty tombstone.
    ///
    /// # Errors
    ///
    /// `TransactionClosed` after commit or abort.
    pub fn delete(&mut self, table: &TableRef, cell: Cell) -> MeridianResult<()> {
        self.put(table, cell, Value::tombstone())
    }

    /// Commits the transaction.
    ///
    /// A transaction with no buffered writes commits without touching
    /// the store. Otherwise the commit takes row locks for every
    /// written row, draws a commit timestamp, rejects the commit if a
    /// concurrent transaction committed to an overlapping cell after
    /// this snapshot, writes the buffer at the start timestamp, and
    /// publishes the commit record. Failure on any step finalizes the
    /// transaction as aborted.
    ///
    /// # Errors
    ///
    /// `TransactionConflict` on a write-write conflict,
    /// `TransactionAborted` when fenced by another party, `LockTimeout`
    /// under unyielding contention, and storage or leadership errors.
    pub fn commit(&mut self) -> MeridianResult<()> {
        self.ensure_open()?;
        if self.writes.is_empty() {
            self.finish(TransactionState::Committed);
            return Ok(());
        }

        self.state = TransactionState::Committing;
        match self.commit_with_locks() {
            Ok(()) => {
                self.finish(TransactionState::Committed);
                Ok(())
            }
            Err(err) => {
                // Make sure a record exists so readers stop waiting on
                // our start timestamp. Losing this race is fine; the
                // record then already holds the truth.
                if let Err(fence_err) = self.deps.transactions.abort(self.start_ts) {
                    debug!(
                        start_ts = %self.start_ts,
                        error = %fence_err,
                        "failed to finalize abort record"
                    );
                }
                self.finish(TransactionState::Aborted);
                Err(err)
            }
        }
    }

    /// Aborts the transaction, discarding every buffered write.
    ///
    /// Aborting an already aborted transaction is a no-op.
    ///
    /// # Errors
    ///
    /// `TransactionClosed` when the transaction already committed.
    pub fn abort(&mut self) -> MeridianResult<()> {
        match self.state {
            TransactionState::Aborted => Ok(()),
            TransactionState::Committed => Err(self.closed_error()),
            TransactionState::Open | TransactionState::Committing => {
                if let Err(err) = self.deps.transactions.abort(self.start_ts) {
                    debug!(
                        start_ts = %self.start_ts,
                        error = %err,
                        "failed to finalize abort record"
                    );
                }
                self.finish(TransactionState::Aborted);
                Ok(())
            }
        }
    }

    fn ensure_open(&self) -> MeridianResult<()> {
        if self.state == TransactionState::Open {
            Ok(())
        } else {
            Err(self.closed_error())
        }
    }

    fn closed_error(&self) -> MeridianError {
        MeridianError::TransactionClosed {
            start_ts: self.start_ts,
            state: self.state.to_string(),
        }
    }

    fn finish(&mut self, state: TransactionState) {
        match state {
            TransactionState::Committed => self.deps.stats.record_commit(),
            TransactionState::Aborted => self.deps.stats.record_abort(),
            TransactionState::Open | TransactionState::Committing => {}
        }
        self.state = state;
        self.open_guard = None;
    }

    /// Walks stored versions downward from the snapshot until one maps
    /// to a commit at or before the start timestamp.
    fn read_committed(&self, table: &TableRef, cell: &Cell) -> MeridianResult<Option<Value>> {
        let mut bound = self.start_ts;
        loop {
            let Some(version) = self.deps.kvs.get(table, cell, bound)? else {
                return Ok(None);
            };
            if version.ts.is_zero() {
                // The reserved slot of CAS-managed cells, not
                // transactional data.
                return Ok(None);
            }
            match self.resolve_commit(version.ts)? {
                Some(commit_ts) if commit_ts <= self.start_ts => {
                    if version.value.is_tombstone() {
                        return Ok(None);
                    }
                    return Ok(Some(version.value));
                }
                // Committed after our snapshot, or aborted: skip below.
                _ => bound = version.ts.prev(),
            }
        }
    }

    /// Maps a version's writer to its commit timestamp, or `None` for
    /// aborted.
    ///
    /// An absent record gets a bounded wait and is then fenced.
    fn resolve_commit(&self, writer_start: Timestamp) -> MeridianResult<Option<Timestamp>> {
        for attempt in 0..PENDING_COMMIT_RETRY_LIMIT {
            if let Some(state) = self.deps.transactions.get_commit_state(writer_start)? {
                return Ok(state.commit_timestamp());
            }
            if attempt + 1 < PENDING_COMMIT_RETRY_LIMIT {
                std::thread::sleep(Duration::from_millis(PENDING_COMMIT_RETRY_PAUSE_MS));
            }
        }
        warn!(
            writer_start = %writer_start,
            reader_start = %self.start_ts,
            "commit record still absent, fencing the writer"
        );
        Ok(self.deps.transactions.abort(writer_start)?.commit_timestamp())
    }

    fn commit_with_locks(&mut self) -> MeridianResult<()> {
        let token = self.acquire_row_locks()?;
        let result = self.commit_locked();
        if let Err(err) = self.deps.locks.unlock(token) {
            debug!(token = %token, error = %err, "failed to release commit locks");
        }
        result
    }

    fn acquire_row_locks(&self) -> MeridianResult<LockToken> {
        let descriptors: Vec<LockDescriptor> = self
            .writes
            .iter()
            .flat_map(|(table, writes)| {
                writes
                    .keys()
                    .map(move |cell| LockDescriptor::from_row(table, cell.row()))
            })
            .collect();
        let request = LockRequest::new(self.client.clone(), descriptors)?;
        match self.deps.locks.lock(&request)? {
            AcquireOutcome::Granted(token) => Ok(token),
            AcquireOutcome::TimedOut => Err(MeridianError::LockTimeout {
                waited_ms: request.acquire_timeout().as_millis() as u64,
            }),
        }
    }

    fn commit_locked(&mut self) -> MeridianResult<()> {
        let commit_ts = self.deps.timestamps.fresh_timestamp()?;
        self.check_conflicts(commit_ts)?;

        for (table, writes) in &self.writes {
            let batch: Vec<(Cell, Value)> = writes
                .iter()
                .map(|(cell, value)| (cell.clone(), value.clone()))
                .collect();
            self.deps.kvs.put(table, &batch, self.start_ts)?;
        }

        match self
            .deps
            .transactions
            .put_unless_exists(self.start_ts, commit_ts)
        {
            Ok(()) => {
                debug!(
                    start_ts = %self.start_ts,
                    commit_ts = %commit_ts,
                    tables = self.writes.len(),
                    "transaction committed"
                );
                Ok(())
            }
            Err(MeridianError::CheckAndSetFailed { .. }) => {
                // A record already exists; someone finalized us first.
                match self.deps.transactions.get_commit_state(self.start_ts)? {
                    Some(CommitState::Committed(_)) => Ok(()),
                    _ => Err(MeridianError::TransactionAborted {
                        start_ts: self.start_ts,
                    }),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Rejects the commit when any written cell carries a version that
    /// committed inside `(start, commit]`.
    ///
    /// Runs while the row locks are held, so any in-flight version
    /// found here belongs to a crashed writer and gets fenced by the
    /// resolution path.
    fn check_conflicts(&self, commit_ts: Timestamp) -> MeridianResult<()> {
        for (table, writes) in &self.writes {
            if self.deps.conflicts.conflict_handler(table)? != ConflictHandler::RetryOnWriteWrite {
                continue;
            }
            let mut conflicting = 0usize;
            for cell in writes.keys() {
                if self.cell_conflicts(table, cell, commit_ts)? {
                    conflicting += 1;
                }
            }
            if conflicting > 0 {
                self.deps.stats.record_conflict();
                return Err(MeridianError::conflict(
                    table.qualified_name(),
                    conflicting,
                ));
            }
        }
        Ok(())
    }

    fn cell_conflicts(
        &self,
        table: &TableRef,
        cell: &Cell,
        commit_ts: Timestamp,
    ) -> MeridianResult<bool> {
        let mut bound = commit_ts;
        loop {
            let Some(version) = self.deps.kvs.get(table, cell, bound)? else {
                return Ok(false);
            };
            if version.ts.is_zero() {
                return Ok(false);
            }
            match self.resolve_commit(version.ts)? {
                Some(other_commit) if other_commit > self.start_ts => return Ok(true),
                // Committed at or before our snapshot: every version
                // below it committed even earlier.
                Some(_) => return Ok(false),
                // Aborted leftover; an older version may still conflict.
                None => bound = version.ts.prev(),
            }
        }
    }

    #[cfg(test)]
    fn buffered_write_count(&self) -> usize {
        self.writes.values().map(BTreeMap::len).sum()
    }
}

impl Drop for SnapshotTransaction {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            if let Err(err) = self.abort() {
                debug!(start_ts = %self.start_ts, error = %err, "abort on drop failed");
            }
        }
    }
}
