//! Per-table conflict and sweep classification.
//!
//! Both classifications are declared in a table's schema at creation
//! time and never change afterwards, so they are read once from the
//! key-value service and cached for the life of the process. The
//! conflict handler gates commit-time write-write detection; the sweep
//! strategy gates what the sweeper may delete.

use std::sync::Arc;

use dashmap::DashMap;
use meridian_common::types::TableRef;
use meridian_common::MeridianResult;
use meridian_kvs::{ConflictHandler, KeyValueService, SweepStrategy};

/// Decides which tables get write-write conflict detection at commit.
pub struct ConflictDetectionManager {
    kvs: Arc<dyn KeyValueService>,
    cache: DashMap<TableRef, ConflictHandler>,
}

impl ConflictDetectionManager {
    /// Creates a manager over the given store.
    #[must_use]
    pub fn new(kvs: Arc<dyn KeyValueService>) -> Self {
        Self {
            kvs,
            cache: DashMap::new(),
        }
    }

    /// The conflict handler declared for a table.
    ///
    /// # Errors
    ///
    /// `TableNotFound` when the table does not exist.
    pub fn conflict_handler(&self, table: &TableRef) -> MeridianResult<ConflictHandler> {
        if let Some(handler) = self.cache.get(table) {
            return Ok(*handler);
        }
        let handler = self.kvs.get_table_schema(table)?.conflict_handler;
        self.cache.insert(table.clone(), handler);
        Ok(handler)
    }
}

/// Decides how aggressively each table may be swept.
pub struct SweepStrategyManager {
    kvs: Arc<dyn KeyValueService>,
    cache: DashMap<TableRef, SweepStrategy>,
}

impl SweepStrategyManager {
    /// Creates a manager over the given store.
    #[must_use]
    pub fn new(kvs: Arc<dyn KeyValueService>) -> Self {
        Self {
            kvs,
            cache: DashMap::new(),
        }
    }

    /// The sweep strategy declared for a table.
    ///
    /// # Errors
    ///
    /// `TableNotFound` when the table does not exist.
    pub fn sweep_strategy(&self, table: &TableRef) -> MeridianResult<SweepStrategy> {
        if let Some(strategy) = self.cache.get(table) {
            return Ok(*strategy);
        }
        let strategy = self.kvs.get_table_schema(table)?.sweep_strategy;
        self.cache.insert(table.clone(), strategy);
        Ok(strategy)
    }
}
