//! Persisted sweep progress.
//!
//! The background sweeper works a table one batch at a time, possibly
//! across restarts and leadership changes. After every batch it
//! persists where it got to; the next iteration, wherever it runs,
//! resumes from there instead of rescanning the table from the top.

use std::sync::Arc;

use bytes::Bytes;
use meridian_common::types::{Cell, TableRef, Timestamp, Value};
use meridian_common::{MeridianError, MeridianResult, CAS_CELL_TIMESTAMP, SWEEP_PROGRESS_TABLE};
use meridian_kvs::{KeyValueService, TableSchema};
use serde::{Deserialize, Serialize};

/// Where a table's sweep last stopped, with running totals.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SweepProgress {
    /// Row to resume from.
    pub next_start_row: Vec<u8>,
    /// Cell/version pairs examined so far.
    pub cell_ts_pairs_examined: u64,
    /// Cell/version pairs deleted so far.
    pub cell_ts_pairs_deleted: u64,
}

impl SweepProgress {
    /// The resume row as shared bytes.
    #[must_use]
    pub fn resume_row(&self) -> Bytes {
        Bytes::from(self.next_start_row.clone())
    }
}

/// Reads and writes per-table progress records.
pub struct SweepProgressStore {
    kvs: Arc<dyn KeyValueService>,
    table: TableRef,
}

impl SweepProgressStore {
    /// Creates the store, making sure the progress table exists.
    ///
    /// # Errors
    ///
    /// Fails when the table cannot be created.
    pub fn create(kvs: Arc<dyn KeyValueService>) -> MeridianResult<Self> {
        let table = TableRef::system(SWEEP_PROGRESS_TABLE);
        kvs.create_table(&table, &TableSchema::system())?;
        Ok(Self { kvs, table })
    }

    /// The persisted progress for `swept`, if any.
    ///
    /// # Errors
    ///
    /// Storage errors or an unreadable record.
    pub fn load(&self, swept: &TableRef) -> MeridianResult<Option<SweepProgress>> {
        let Some(read) = self
            .kvs
            .get(&self.table, &Self::cell(swept), Timestamp::MAX)?
        else {
            return Ok(None);
        };
        if read.value.is_tombstone() {
            return Ok(None);
        }
        let progress = bincode::deserialize(read.value.as_bytes()).map_err(|err| {
            MeridianError::corruption(format!(
                "sweep progress for '{}' is unreadable: {err}",
                swept.qualified_name()
            ))
        })?;
        Ok(Some(progress))
    }

    /// Overwrites the progress record for `swept`.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub fn save(&self, swept: &TableRef, progress: &SweepProgress) -> MeridianResult<()> {
        let bytes = bincode::serialize(progress)
            .map_err(|err| MeridianError::internal(format!("progress encoding failed: {err}")))?;
        self.kvs.put(
            &self.table,
            &[(Self::cell(swept), Value::from_vec(bytes))],
            Timestamp::new(CAS_CELL_TIMESTAMP),
        )
    }

    /// Removes the record; the table's next sweep starts from the top.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub fn clear(&self, swept: &TableRef) -> MeridianResult<()> {
        self.kvs.delete(
            &self.table,
            &Self::cell(swept),
            Timestamp::new(CAS_CELL_TIMESTAMP),
        )
    }

    /// Tables with a persisted record, in table order.
    #[must_use]
    pub fn tables_in_progress(&self, candidates: &[TableRef]) -> Vec<TableRef> {
        candidates
            .iter()
            .filter(|table| matches!(self.load(table), Ok(Some(_))))
            .cloned()
            .collect()
    }

    fn cell(swept: &TableRef) -> Cell {
        Cell::new(swept.qualified_name().into_bytes(), &b"p"[..])
    }
}
