//! Transaction lifecycle and watermarks.
//!
//! The manager is the front door of the transaction layer: it draws
//! start timestamps, tracks which transactions are still open, and
//! derives the watermarks the sweeper keys off. The registry mutex is
//! held across the timestamp draw itself, so a watermark computed at
//! any instant can never exceed the start timestamp of a transaction
//! whose begin is in progress.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use meridian_common::types::{ClientId, Timestamp};
use meridian_common::{MeridianError, MeridianResult, DEFAULT_TRANSACTION_RETRIES};
use meridian_kvs::KeyValueService;
use meridian_lock::LockService;
use meridian_timestamp::TimestampService;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::conflict::ConflictDetectionManager;
use crate::snapshot::{SnapshotTransaction, TxnDeps};
use crate::service::TransactionService;

/// Counters for the transaction layer.
#[derive(Debug, Default)]
pub struct TxnStats {
    begins: AtomicU64,
    commits: AtomicU64,
    aborts: AtomicU64,
    conflicts: AtomicU64,
    retries: AtomicU64,
}

impl TxnStats {
    pub(crate) fn record_begin(&self) {
        self.begins.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_abort(&self) {
        self.aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Transactions begun.
    pub fn begins(&self) -> u64 {
        self.begins.load(Ordering::Relaxed)
    }

    /// Transactions committed.
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Transactions aborted.
    pub fn aborts(&self) -> u64 {
        self.aborts.load(Ordering::Relaxed)
    }

    /// Commits rejected for write-write conflicts.
    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    /// Attempts rerun by the retrying runner.
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }
}

/// The set of start timestamps with an open transaction behind them.
pub struct OpenRegistry {
    open: Mutex<BTreeSet<u64>>,
}

impl OpenRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            open: Mutex::new(BTreeSet::new()),
        }
    }

    /// Draws a start timestamp through `issue` and registers it as one
    /// atomic step.
    ///
    /// The registry lock is held across the draw, which is what keeps
    /// [`watermark_with`] from racing past a begin in progress.
    ///
    /// [`watermark_with`]: OpenRegistry::watermark_with
    pub fn begin_with(
        self: &Arc<Self>,
        issue: impl FnOnce() -> MeridianResult<Timestamp>,
    ) -> MeridianResult<(Timestamp, OpenGuard)> {
        let mut open = self.open.lock();
        let start_ts = issue()?;
        open.insert(start_ts.as_u64());
        Ok((
            start_ts,
            OpenGuard {
                registry: Arc::clone(self),
                start_ts,
            },
        ))
    }

    /// The smallest open start timestamp, or a fresh timestamp drawn
    /// through `fallback` when nothing is open.
    ///
    /// Taken under the registry lock, so every transaction that begins
    /// later starts strictly above the returned value.
    pub fn watermark_with(
        &self,
        fallback: impl FnOnce() -> MeridianResult<Timestamp>,
    ) -> MeridianResult<Timestamp> {
        let open = self.open.lock();
        match open.first() {
            Some(&min) => Ok(Timestamp::new(min)),
            None => fallback(),
        }
    }

    /// Number of open transactions.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.open.lock().len()
    }

    fn finish(&self, start_ts: Timestamp) {
        self.open.lock().remove(&start_ts.as_u64());
    }
}

impl Default for OpenRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes its start timestamp from the registry when dropped.
pub struct OpenGuard {
    registry: Arc<OpenRegistry>,
    start_ts: Timestamp,
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.registry.finish(self.start_ts);
    }
}

/// Source of the timestamps that bound what the sweeper may touch.
pub trait WatermarkSource: Send + Sync {
    /// No committed state below this timestamp is needed by any open
    /// snapshot read.
    ///
    /// # Errors
    ///
    /// Fails when the fallback timestamp cannot be drawn.
    fn unreadable_timestamp(&self) -> MeridianResult<Timestamp>;

    /// No open transaction will write a version tagged below this
    /// timestamp.
    ///
    /// # Errors
    ///
    /// Fails when the fallback timestamp cannot be drawn.
    fn immutable_timestamp(&self) -> MeridianResult<Timestamp>;

    /// The bound the sweeper uses: versions strictly below it may be
    /// reclaimed without any open transaction noticing.
    ///
    /// # Errors
    ///
    /// Fails when either constituent does.
    fn sweep_watermark(&self) -> MeridianResult<Timestamp> {
        let unreadable = self.unreadable_timestamp()?;
        let immutable = self.immutable_timestamp()?;
        Ok(unreadable.min(immutable))
    }
}

/// Begins transactions and runs retrying transaction tasks.
pub struct TransactionManager {
    deps: Arc<TxnDeps>,
    registry: Arc<OpenRegistry>,
    client: ClientId,
    unreadable_floor: AtomicU64,
    immutable_floor: AtomicU64,
}

impl TransactionManager {
    /// Wires the transaction layer over the given services.
    ///
    /// # Errors
    ///
    /// Fails when the commit table cannot be created.
    pub fn create(
        kvs: Arc<dyn KeyValueService>,
        timestamps: Arc<dyn TimestampService>,
        locks: Arc<LockService>,
        client: ClientId,
    ) -> MeridianResult<Self> {
        let transactions = Arc::new(TransactionService::create(Arc::clone(&kvs))?);
        let conflicts = Arc::new(ConflictDetectionManager::new(Arc::clone(&kvs)));
        info!(client = %client, "transaction manager ready");
        Ok(Self {
            deps: Arc::new(TxnDeps {
                kvs,
                transactions,
                locks,
                timestamps,
                conflicts,
                stats: Arc::new(TxnStats::default()),
            }),
            registry: Arc::new(OpenRegistry::new()),
            client,
            unreadable_floor: AtomicU64::new(0),
            immutable_floor: AtomicU64::new(0),
        })
    }

    /// Layer counters.
    #[must_use]
    pub fn stats(&self) -> &TxnStats {
        &self.deps.stats
    }

    /// The commit table service, shared with the sweeper.
    #[must_use]
    pub fn transaction_service(&self) -> Arc<TransactionService> {
        Arc::clone(&self.deps.transactions)
    }

    /// Number of transactions currently open.
    #[must_use]
    pub fn open_transaction_count(&self) -> usize {
        self.registry.open_count()
    }

    /// Begins a transaction at a fresh snapshot.
    ///
    /// # Errors
    ///
    /// Fails when this node is not the leader or the oracle does.
    pub fn begin(&self) -> MeridianResult<SnapshotTransaction> {
        let (start_ts, guard) = self
            .registry
            .begin_with(|| self.deps.timestamps.fresh_timestamp())?;
        self.deps.stats.record_begin();
        debug!(start_ts = %start_ts, "transaction started");
        Ok(SnapshotTransaction::new(
            Arc::clone(&self.deps),
            self.client.clone(),
            start_ts,
            Some(guard),
        ))
    }

    /// Runs `task` in a fresh transaction, committing on success and
    /// retrying the whole task from a new snapshot on retryable
    /// failures.
    ///
    /// The task may run several times and must not carry side effects
    /// outside the transaction.
    ///
    /// # Errors
    ///
    /// `TooManyRetries` when `attempts` tries all failed retryably;
    /// the first non-retryable error is returned as is.
    pub fn run_with_retry<T>(
        &self,
        attempts: u32,
        task: impl Fn(&mut SnapshotTransaction) -> MeridianResult<T>,
    ) -> MeridianResult<T> {
        let attempts = attempts.max(1);
        let mut last_error = String::new();
        for attempt in 0..attempts {
            if attempt > 0 {
                self.deps.stats.record_retry();
            }
            let mut txn = self.begin()?;
            let outcome = task(&mut txn).and_then(|value| {
                txn.commit()?;
                Ok(value)
            });
            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    debug!(
                        attempt = attempt + 1,
                        error = %err,
                        "retryable transaction failure"
                    );
                    last_error = err.to_string();
                }
                Err(err) => return Err(err),
            }
        }
        Err(MeridianError::TooManyRetries {
            attempts,
            last_error,
        })
    }

    /// As [`run_with_retry`] with the default attempt budget.
    ///
    /// # Errors
    ///
    /// As [`run_with_retry`].
    ///
    /// [`run_with_retry`]: TransactionManager::run_with_retry
    pub fn run<T>(
        &self,
        task: impl Fn(&mut SnapshotTransaction) -> MeridianResult<T>,
    ) -> MeridianResult<T> {
        self.run_with_retry(DEFAULT_TRANSACTION_RETRIES, task)
    }

    // Watermarks handed out once must never move backwards, so each is
    // clamped against the largest value previously returned.
    fn clamped_watermark(&self, floor: &AtomicU64) -> MeridianResult<Timestamp> {
        let raw = self
            .registry
            .watermark_with(|| self.deps.timestamps.fresh_timestamp())?
            .as_u64();
        let previous = floor.fetch_max(raw, Ordering::SeqCst);
        Ok(Timestamp::new(raw.max(previous)))
    }
}

impl WatermarkSource for TransactionManager {
    fn unreadable_timestamp(&self) -> MeridianResult<Timestamp> {
        self.clamped_watermark(&self.unreadable_floor)
    }

    fn immutable_timestamp(&self) -> MeridianResult<Timestamp> {
        self.clamped_watermark(&self.immutable_floor)
    }
}
