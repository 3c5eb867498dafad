//! The background sweep loop.
//!
//! One thread per cluster walks user tables round-robin, one batch per
//! iteration, resuming from persisted progress. Tables with a progress
//! record go first, so a half-swept table is finished before a new one
//! is started. The persistent lock is taken for the duration of each
//! batch and released immediately after; when a backup holds it, the
//! loop waits out the configured pause and tries again.
//!
//! Nothing thrown by a batch kills the loop: errors are logged and the
//! next iteration proceeds.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use meridian_common::types::TableRef;
use meridian_common::{
    MeridianResult, DEFAULT_SWEEP_PAUSE_MILLIS, DEFAULT_SWEEP_PERSISTENT_LOCK_WAIT_MILLIS,
};
use meridian_kvs::KeyValueService;
use parking_lot::{Condvar, Mutex};
use tracing::{info, warn};

use crate::lock::PersistentLockManager;
use crate::progress::{SweepProgress, SweepProgressStore};
use crate::task::{SweepBatchConfig, SweepTaskRunner};

/// Tuning for the background loop.
#[derive(Debug, Clone)]
pub struct BackgroundSweepSettings {
    /// Whether the loop runs at all.
    pub enabled: bool,
    /// Pause between iterations.
    pub pause: Duration,
    /// Pause after finding the persistent lock taken.
    pub lock_wait: Duration,
    /// Batch limits for each run.
    pub batch: SweepBatchConfig,
}

impl Default for BackgroundSweepSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            pause: Duration::from_millis(DEFAULT_SWEEP_PAUSE_MILLIS),
            lock_wait: Duration::from_millis(DEFAULT_SWEEP_PERSISTENT_LOCK_WAIT_MILLIS),
            batch: SweepBatchConfig::default(),
        }
    }
}

struct Shared {
    shutdown: Mutex<bool>,
    wake: Condvar,
}

struct Worker {
    kvs: Arc<dyn KeyValueService>,
    runner: Arc<SweepTaskRunner>,
    progress: Arc<SweepProgressStore>,
    lock: Arc<PersistentLockManager>,
    settings: BackgroundSweepSettings,
    cursor: usize,
}

/// Owns the background sweep thread.
pub struct BackgroundSweeper {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundSweeper {
    /// Starts the loop, or returns an inert handle when disabled.
    #[must_use]
    pub fn start(
        kvs: Arc<dyn KeyValueService>,
        runner: Arc<SweepTaskRunner>,
        progress: Arc<SweepProgressStore>,
        lock: Arc<PersistentLockManager>,
        settings: BackgroundSweepSettings,
    ) -> Self {
        let shared = Arc::new(Shared {
            shutdown: Mutex::new(false),
            wake: Condvar::new(),
        });

        if !settings.enabled {
            info!("background sweep disabled by configuration");
            return Self {
                shared,
                handle: None,
            };
        }

        let handle = {
            let shared = Arc::clone(&shared);
            let mut worker = Worker {
                kvs,
                runner,
                progress,
                lock,
                settings,
                cursor: 0,
            };
            std::thread::Builder::new()
                .name("background-sweeper".to_string())
                .spawn(move || worker.run(&shared))
                .expect("failed to spawn background sweeper thread")
        };
        info!("background sweeper started");

        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// Whether the loop thread is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Stops the loop and waits for the thread to exit.
    pub fn shutdown(&mut self) {
        *self.shared.shutdown.lock() = true;
        self.shared.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BackgroundSweeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Worker {
    fn run(&mut self, shared: &Shared) {
        let mut pause = self.settings.pause;
        loop {
            {
                let mut stopped = shared.shutdown.lock();
                if !*stopped {
                    shared.wake.wait_for(&mut stopped, pause);
                }
                if *stopped {
                    return;
                }
            }

            pause = match self.sweep_one() {
                Ok(ran) if ran => self.settings.pause,
                // Lock contention or nothing to do: wait longer.
                Ok(_) => self.settings.lock_wait,
                Err(err) => {
                    warn!(error = %err, "sweep iteration failed");
                    self.settings.pause
                }
            };
        }
    }

    /// One iteration: pick a table, take the lock, run one batch.
    /// Returns false when the lock was busy or no table qualifies.
    fn sweep_one(&mut self) -> MeridianResult<bool> {
        let Some(table) = self.next_table() else {
            return Ok(false);
        };
        if !self.lock.try_acquire()? {
            return Ok(false);
        }
        let result = self.sweep_table(&table);
        if let Err(err) = self.lock.release() {
            warn!(error = %err, "persistent lock release failed");
        }
        result.map(|()| true)
    }

    fn sweep_table(&self, table: &TableRef) -> MeridianResult<()> {
        let resumed = self.progress.load(table)?;
        let start_row: Option<Bytes> = resumed.as_ref().map(SweepProgress::resume_row);

        let outcome = self.runner.run(table, start_row, &self.settings.batch)?;

        match outcome.next_start_row {
            Some(next) => {
                let prior = resumed.unwrap_or_default();
                self.progress.save(
                    table,
                    &SweepProgress {
                        next_start_row: next.to_vec(),
                        cell_ts_pairs_examined: prior.cell_ts_pairs_examined
                            + outcome.cell_ts_pairs_examined,
                        cell_ts_pairs_deleted: prior.cell_ts_pairs_deleted
                            + outcome.cell_ts_pairs_deleted,
                    },
                )?;
            }
            None => {
                self.progress.clear(table)?;
                info!(
                    table = %table.qualified_name(),
                    deleted = outcome.cell_ts_pairs_deleted,
                    "table sweep pass complete"
                );
            }
        }
        Ok(())
    }

    /// Round-robin over user tables, finishing in-progress tables
    /// first.
    fn next_table(&mut self) -> Option<TableRef> {
        let tables: Vec<TableRef> = self
            .kvs
            .get_all_table_names()
            .into_iter()
            .filter(|table| !table.is_system())
            .collect();
        if tables.is_empty() {
            return None;
        }

        let in_progress = self.progress.tables_in_progress(&tables);
        if let Some(table) = in_progress.first() {
            return Some(table.clone());
        }

        self.cursor = (self.cursor + 1) % tables.len();
        Some(tables[self.cursor].clone())
    }
}
