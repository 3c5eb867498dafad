//! KVS-backed bound store.
//!
//! Stores the limit as a single check-and-set managed cell in the
//! `_timestamp` table, 8 bytes big-endian. Every write expects the
//! previous value (or absence, on first use), so two oracle instances
//! racing on the same store cannot both succeed; the loser's CAS
//! failure surfaces as a not-leader error.

use std::sync::Arc;

use meridian_common::types::{Cell, TableRef, Timestamp, Value};
use meridian_common::{MeridianError, MeridianResult, TIMESTAMP_TABLE};
use meridian_kvs::{CheckAndSetRequest, KeyValueService, TableSchema};
use parking_lot::Mutex;
use tracing::warn;

use super::TimestampBoundStore;

const BOUND_ROW: &[u8] = b"ts";
const BOUND_COLUMN: &[u8] = b"ts";

/// Timestamp bound store in the `_timestamp` system table.
pub struct KvsTimestampBoundStore {
    kvs: Arc<dyn KeyValueService>,
    table: TableRef,
    /// The raw value this instance last read or wrote, used as the
    /// expectation of the next check-and-set.
    expected: Mutex<Option<Value>>,
}

impl KvsTimestampBoundStore {
    /// Creates the store, ensuring the `_timestamp` table exists.
    ///
    /// # Errors
    ///
    /// Fails when the table cannot be created or the backing store
    /// does not support check-and-set.
    pub fn create(kvs: Arc<dyn KeyValueService>) -> MeridianResult<Self> {
        if !kvs.supports_check_and_set() {
            return Err(MeridianError::NotSupported {
                operation: "check-and-set, required for the KVS timestamp bound store".to_string(),
            });
        }
        let table = TableRef::system(TIMESTAMP_TABLE);
        kvs.create_table(&table, &TableSchema::system())?;
        Ok(Self {
            kvs,
            table,
            expected: Mutex::new(None),
        })
    }

    fn bound_cell() -> Cell {
        Cell::new(BOUND_ROW, BOUND_COLUMN)
    }

    fn encode_bound(bound: Timestamp) -> Value {
        Value::from_vec(bound.to_be_bytes().to_vec())
    }

    fn decode_bound(data: &[u8]) -> MeridianResult<Timestamp> {
        if data.len() == 1 {
            return Err(MeridianError::corruption(
                "timestamp bound cell holds a one-byte invalidation marker, \
                 the bound must be restored before serving",
            ));
        }
        let raw: [u8; 8] = data.try_into().map_err(|_| {
            MeridianError::corruption(format!(
                "timestamp bound has {} bytes, expected 8",
                data.len()
            ))
        })?;
        Ok(Timestamp::from_be_bytes(raw))
    }

    fn read_current(&self) -> MeridianResult<Option<Value>> {
        Ok(self
            .kvs
            .get(&self.table, &Self::bound_cell(), Timestamp::MAX)?
            .map(|versioned| versioned.value))
    }
}

impl TimestampBoundStore for KvsTimestampBoundStore {
    fn get_upper_limit(&self) -> MeridianResult<Timestamp> {
        let mut expected = self.expected.lock();
        match self.read_current()? {
            None => {
                *expected = None;
                Ok(Timestamp::ZERO)
            }
            Some(value) => {
                let bound = Self::decode_bound(value.as_bytes())?;
                *expected = Some(value);
                Ok(bound)
            }
        }
    }

    fn store_upper_limit(&self, limit: Timestamp) -> MeridianResult<()> {
        let mut expected = self.expected.lock();
        if let Some(previous) = expected.as_ref() {
            let current = Self::decode_bound(previous.as_bytes())?;
            if limit < current {
                return Err(MeridianError::internal(format!(
                    "timestamp bound regression: {} is below the stored limit {}",
                    limit, current
                )));
            }
        }

        let new_value = Self::encode_bound(limit);
        let request = match expected.clone() {
            None => CheckAndSetRequest::new_cell(
                self.table.clone(),
                &Self::bound_cell(),
                new_value.clone(),
            ),
            Some(previous) => CheckAndSetRequest::update_cell(
                self.table.clone(),
                &Self::bound_cell(),
                previous,
                new_value.clone(),
            ),
        };

        match self.kvs.check_and_set(&request) {
            Ok(()) => {
                *expected = Some(new_value);
                Ok(())
            }
            Err(MeridianError::CheckAndSetFailed { .. }) => {
                // Pick up the foreign value so a later attempt can
                // CAS against reality.
                let actual = self.read_current()?;
                warn!(
                    proposed = %limit,
                    stored = ?actual.as_ref().map(|v| Self::decode_bound(v.as_bytes())),
                    "timestamp bound CAS failed, another oracle instance is active"
                );
                *expected = actual;
                Err(MeridianError::not_leader(None))
            }
            Err(err) => Err(err),
        }
    }
}
