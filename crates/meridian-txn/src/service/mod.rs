//! The commit table.
//!
//! One row per transaction, keyed by start timestamp, holding the
//! commit timestamp (or the aborted sentinel) as its single value. The
//! row is written exactly once, through check-and-set with an absence
//! expectation, and is the sole source of truth for whether a version
//! written at some start timestamp is visible.
//!
//! Because the record is write-once, any party may finalize a stalled
//! transaction by writing the aborted sentinel: either the write lands
//! (the transaction is now aborted) or it loses the race to the real
//! commit, and the loser learns the true outcome from the record.

use std::sync::Arc;

use bytes::Bytes;
use meridian_common::types::{Cell, TableRef, Timestamp, Value};
use meridian_common::{MeridianError, MeridianResult, ABORTED_COMMIT_VALUE, TRANSACTION_TABLE};
use meridian_kvs::{CheckAndSetRequest, KeyValueService, TableSchema};
use tracing::debug;

/// The recorded outcome of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    /// The transaction committed at this timestamp.
    Committed(Timestamp),
    /// The transaction was aborted (by itself or by a fencer).
    Aborted,
}

impl CommitState {
    /// The commit timestamp, when committed.
    #[must_use]
    pub fn commit_timestamp(&self) -> Option<Timestamp> {
        match self {
            Self::Committed(ts) => Some(*ts),
            Self::Aborted => None,
        }
    }
}

/// Reads and writes commit records.
pub struct TransactionService {
    kvs: Arc<dyn KeyValueService>,
    table: TableRef,
}

impl TransactionService {
    /// Creates the service, making sure the commit table exists.
    ///
    /// # Errors
    ///
    /// Fails when the table cannot be created.
    pub fn create(kvs: Arc<dyn KeyValueService>) -> MeridianResult<Self> {
        let table = TableRef::system(TRANSACTION_TABLE);
        kvs.create_table(&table, &TableSchema::system())?;
        Ok(Self { kvs, table })
    }

    /// Looks up the recorded outcome for a start timestamp.
    ///
    /// `None` means the transaction is still in flight (or crashed
    /// before finalizing); callers decide whether to wait or fence.
    ///
    /// # Errors
    ///
    /// Fails on storage errors or an unparseable record.
    pub fn get_commit_state(&self, start_ts: Timestamp) -> MeridianResult<Option<CommitState>> {
        let Some(read) = self.kvs.get(&self.table, &Self::cell(start_ts), Timestamp::MAX)? else {
            return Ok(None);
        };
        Ok(Some(Self::decode(start_ts, &read.value)?))
    }

    /// Writes the commit record, failing if any record already exists.
    ///
    /// This is the single atomic step that makes a transaction's writes
    /// visible; success here is irrevocable.
    ///
    /// # Errors
    ///
    /// `CheckAndSetFailed` when a record already exists, meaning a
    /// fencer (or a duplicate attempt) finalized this transaction
    /// first.
    pub fn put_unless_exists(
        &self,
        start_ts: Timestamp,
        commit_ts: Timestamp,
    ) -> MeridianResult<()> {
        if commit_ts <= start_ts {
            return Err(MeridianError::internal(format!(
                "commit timestamp {commit_ts} not above start timestamp {start_ts}"
            )));
        }
        self.kvs.check_and_set(&CheckAndSetRequest::new_cell(
            self.table.clone(),
            &Self::cell(start_ts),
            Self::encode(commit_ts.as_u64()),
        ))
    }

    /// Finalizes a transaction as aborted unless it already committed.
    ///
    /// Used by the transaction itself on failure and by readers and the
    /// sweeper to fence a writer whose record never appeared. Returns
    /// the state the record ended up in, whichever party wrote it.
    ///
    /// # Errors
    ///
    /// Fails on storage errors, or when losing the race leaves a record
    /// that still cannot be read back.
    pub fn abort(&self, start_ts: Timestamp) -> MeridianResult<CommitState> {
        let request = CheckAndSetRequest::new_cell(
            self.table.clone(),
            &Self::cell(start_ts),
            Self::encode(ABORTED_COMMIT_VALUE),
        );
        match self.kvs.check_and_set(&request) {
            Ok(()) => {
                debug!(start_ts = %start_ts, "transaction fenced as aborted");
                Ok(CommitState::Aborted)
            }
            Err(MeridianError::CheckAndSetFailed { .. }) => self
                .get_commit_state(start_ts)?
                .ok_or_else(|| {
                    MeridianError::internal(format!(
                        "commit record for {start_ts} vanished after a check-and-set race"
                    ))
                }),
            Err(err) => Err(err),
        }
    }

    fn cell(start_ts: Timestamp) -> Cell {
        Cell::new(Bytes::copy_from_slice(&start_ts.to_be_bytes()), &b"t"[..])
    }

    fn encode(commit: u64) -> Value {
        Value::from_bytes(&commit.to_be_bytes())
    }

    fn decode(start_ts: Timestamp, value: &Value) -> MeridianResult<CommitState> {
        let raw: [u8; 8] = value.as_bytes().try_into().map_err(|_| {
            MeridianError::corruption(format!(
                "commit record for {start_ts} has {} bytes, expected 8",
                value.len()
            ))
        })?;
        let commit = u64::from_be_bytes(raw);
        if commit == ABORTED_COMMIT_VALUE {
            Ok(CommitState::Aborted)
        } else {
            Ok(CommitState::Committed(Timestamp::new(commit)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_kvs::InMemoryKeyValueService;

    fn service() -> TransactionService {
        TransactionService::create(Arc::new(InMemoryKeyValueService::new())).unwrap()
    }

    #[test]
    fn test_absent_record_reads_as_in_flight() {
        let service = service();
        assert_eq!(service.get_commit_state(Timestamp::new(10)).unwrap(), None);
    }

    #[test]
    fn test_commit_record_round_trip() {
        let service = service();
        service
            .put_unless_exists(Timestamp::new(10), Timestamp::new(11))
            .unwrap();
        assert_eq!(
            service.get_commit_state(Timestamp::new(10)).unwrap(),
            Some(CommitState::Committed(Timestamp::new(11)))
        );
    }

    #[test]
    fn test_record_is_write_once() {
        let service = service();
        service
            .put_unless_exists(Timestamp::new(10), Timestamp::new(11))
            .unwrap();

        let err = service
            .put_unless_exists(Timestamp::new(10), Timestamp::new(12))
            .unwrap_err();
        assert!(matches!(err, MeridianError::CheckAndSetFailed { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_commit_must_follow_start() {
        let service = service();
        let err = service
            .put_unless_exists(Timestamp::new(10), Timestamp::new(10))
            .unwrap_err();
        assert!(matches!(err, MeridianError::Internal { .. }));
    }

    #[test]
    fn test_abort_fences_an_in_flight_transaction() {
        let service = service();
        assert_eq!(
            service.abort(Timestamp::new(10)).unwrap(),
            CommitState::Aborted
        );
        assert_eq!(
            service.get_commit_state(Timestamp::new(10)).unwrap(),
            Some(CommitState::Aborted)
        );

        // A later commit attempt finds the fence.
        let err = service
            .put_unless_exists(Timestamp::new(10), Timestamp::new(11))
            .unwrap_err();
        assert!(matches!(err, MeridianError::CheckAndSetFailed { .. }));
    }

    #[test]
    fn test_abort_loses_to_an_existing_commit() {
        let service = service();
        service
            .put_unless_exists(Timestamp::new(10), Timestamp::new(11))
            .unwrap();
        assert_eq!(
            service.abort(Timestamp::new(10)).unwrap(),
            CommitState::Committed(Timestamp::new(11))
        );
    }

    #[test]
    fn test_abort_is_idempotent() {
        let service = service();
        assert_eq!(
            service.abort(Timestamp::new(10)).unwrap(),
            CommitState::Aborted
        );
        assert_eq!(
            service.abort(Timestamp::new(10)).unwrap(),
            CommitState::Aborted
        );
    }
}
