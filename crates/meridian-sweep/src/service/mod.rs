//! The manual sweep trigger.
//!
//! Operators point this at one table and get one sweep batch, with the
//! batch limits resolved from the request, falling back to any runtime
//! override, then to the defaults. The service validates everything
//! before touching the store and bypasses both persisted progress and
//! the background pause.

use std::sync::Arc;

use bytes::Bytes;
use meridian_common::types::TableRef;
use meridian_common::{MeridianError, MeridianResult};
use meridian_kvs::SweepStrategy;
use meridian_txn::SweepStrategyManager;
use tracing::info;

use crate::task::{SweepBatchConfig, SweepTaskRunner};

/// One manual sweep request.
#[derive(Debug, Clone, Default)]
pub struct SweepRequest {
    /// Qualified table name, `namespace.table`.
    pub table_name: String,
    /// Row to start from; `None` starts at the top.
    pub start_row: Option<Bytes>,
    /// Override for the examined-pairs budget.
    pub max_cell_ts_pairs_to_examine: Option<usize>,
    /// Override for the candidate batch size.
    pub candidate_batch_size: Option<usize>,
    /// Override for the delete batch size.
    pub delete_batch_size: Option<usize>,
}

/// What one manual sweep accomplished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepResponse {
    /// Cell/version pairs examined.
    pub cell_ts_pairs_examined: u64,
    /// Versions deleted.
    pub cell_ts_pairs_deleted: u64,
    /// Whether another request is needed to finish the table, and if
    /// so, where to continue.
    pub next_start_row: Option<Bytes>,
}

impl SweepResponse {
    /// Whether the table still has unswept rows.
    #[must_use]
    pub fn more_to_sweep(&self) -> bool {
        self.next_start_row.is_some()
    }
}

/// Partial batch limits applied between a request and the defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepConfigOverrides {
    /// Override for the examined-pairs budget.
    pub max_cell_ts_pairs_to_examine: Option<usize>,
    /// Override for the candidate batch size.
    pub candidate_batch_size: Option<usize>,
    /// Override for the delete batch size.
    pub delete_batch_size: Option<usize>,
}

/// First non-null wins: request, then runtime override, then default.
fn choose_best_value<T: Copy>(request: Option<T>, runtime: Option<T>, default: T) -> T {
    request.or(runtime).unwrap_or(default)
}

/// Runs operator-triggered sweeps.
pub struct SweeperService {
    strategies: Arc<SweepStrategyManager>,
    runner: Arc<SweepTaskRunner>,
    overrides: SweepConfigOverrides,
}

impl SweeperService {
    /// Creates the service with runtime overrides applied to every
    /// request that leaves a limit unset.
    #[must_use]
    pub fn new(
        strategies: Arc<SweepStrategyManager>,
        runner: Arc<SweepTaskRunner>,
        overrides: SweepConfigOverrides,
    ) -> Self {
        Self {
            strategies,
            runner,
            overrides,
        }
    }

    /// Sweeps one batch as described by the request.
    ///
    /// # Errors
    ///
    /// `InvalidTableName` for an unparseable name (system table names
    /// never parse as user tables), `TableNotFound` for missing ones,
    /// `TableNotSweepable` when the table's strategy forbids sweeping,
    /// and `InvalidArgument` for zero batch limits.
    pub fn sweep(&self, request: &SweepRequest) -> MeridianResult<SweepResponse> {
        let table = TableRef::from_qualified_name(&request.table_name)?;
        if self.strategies.sweep_strategy(&table)? == SweepStrategy::Nothing {
            return Err(MeridianError::TableNotSweepable {
                table: table.qualified_name(),
                reason: "the table was created with the Nothing sweep strategy".to_string(),
            });
        }
        let config = self.resolve_config(request)?;

        info!(
            table = %table.qualified_name(),
            from_top = request.start_row.is_none(),
            "manual sweep requested"
        );
        let outcome = self
            .runner
            .run(&table, request.start_row.clone(), &config)?;
        Ok(SweepResponse {
            cell_ts_pairs_examined: outcome.cell_ts_pairs_examined,
            cell_ts_pairs_deleted: outcome.cell_ts_pairs_deleted,
            next_start_row: outcome.next_start_row,
        })
    }

    fn resolve_config(&self, request: &SweepRequest) -> MeridianResult<SweepBatchConfig> {
        let defaults = SweepBatchConfig::default();
        let config = SweepBatchConfig {
            max_cell_ts_pairs_to_examine: choose_best_value(
                request.max_cell_ts_pairs_to_examine,
                self.overrides.max_cell_ts_pairs_to_examine,
                defaults.max_cell_ts_pairs_to_examine,
            ),
            candidate_batch_size: choose_best_value(
                request.candidate_batch_size,
                self.overrides.candidate_batch_size,
                defaults.candidate_batch_size,
            ),
            delete_batch_size: choose_best_value(
                request.delete_batch_size,
                self.overrides.delete_batch_size,
                defaults.delete_batch_size,
            ),
        };
        if config.max_cell_ts_pairs_to_examine == 0
            || config.candidate_batch_size == 0
            || config.delete_batch_size == 0
        {
            return Err(MeridianError::invalid_argument(
                "sweep batch limits must be at least 1",
            ));
        }
        Ok(config)
    }
}
