//! Timestamp bound stores.
//!
//! A bound store persists one number: the exclusive ceiling below which
//! the oracle may issue timestamps without touching durable storage
//! again. The store is the crash-safety anchor of the oracle, so every
//! implementation must make `store_upper_limit` durable before
//! returning and must surface concurrent writers as errors rather than
//! letting two oracles issue from overlapping ranges.

use std::sync::atomic::{AtomicU64, Ordering};

use meridian_common::types::Timestamp;
use meridian_common::{MeridianError, MeridianResult};

mod kvs;
mod paxos;

pub use kvs::KvsTimestampBoundStore;
pub use paxos::PaxosTimestampBoundStore;

/// Durable storage for the timestamp upper limit.
pub trait TimestampBoundStore: Send + Sync {
    /// Reads the persisted upper limit.
    ///
    /// Returns `Timestamp::ZERO` when nothing has been stored yet.
    ///
    /// # Errors
    ///
    /// Fails when the backing store is unreachable or holds data that
    /// does not parse as a bound.
    fn get_upper_limit(&self) -> MeridianResult<Timestamp>;

    /// Persists a new upper limit.
    ///
    /// The new limit must not regress. Implementations fail with a
    /// not-leader error when another oracle instance has moved the
    /// bound underneath this one.
    ///
    /// # Errors
    ///
    /// Fails on storage errors, regressions, and concurrent writers.
    fn store_upper_limit(&self, limit: Timestamp) -> MeridianResult<()>;
}

/// Bound store backed by a single atomic, for tests and embedded use.
///
/// Detects regressions like the durable stores do, but naturally
/// provides no crash safety.
#[derive(Debug, Default)]
pub struct InMemoryTimestampBoundStore {
    limit: AtomicU64,
}

impl InMemoryTimestampBoundStore {
    /// Creates a store with no limit persisted yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            limit: AtomicU64::new(0),
        }
    }

    /// Creates a store seeded with an existing limit, as if a previous
    /// oracle instance had already run.
    #[must_use]
    pub fn with_limit(limit: Timestamp) -> Self {
        Self {
            limit: AtomicU64::new(limit.as_u64()),
        }
    }
}

impl TimestampBoundStore for InMemoryTimestampBoundStore {
    fn get_upper_limit(&self) -> MeridianResult<Timestamp> {
        Ok(Timestamp::new(self.limit.load(Ordering::SeqCst)))
    }

    fn store_upper_limit(&self, limit: Timestamp) -> MeridianResult<()> {
        let mut current = self.limit.load(Ordering::SeqCst);
        loop {
            if limit.as_u64() < current {
                return Err(MeridianError::internal(format!(
                    "timestamp bound regression: {} is below the stored limit {}",
                    limit, current
                )));
            }
            match self.limit.compare_exchange(
                current,
                limit.as_u64(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }
}
