//! The timestamp service.
//!
//! Issues strictly increasing timestamps backed by a durable upper
//! limit. The limit is raised in large steps so that the common path
//! is a counter bump under a mutex; the durable store is touched once
//! per allocation buffer.

use std::sync::Arc;

use meridian_common::types::Timestamp;
use meridian_common::{
    LeadershipState, MeridianError, MeridianResult, MAX_TIMESTAMPS_PER_REQUEST,
    TIMESTAMP_ALLOCATION_BUFFER,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bound::TimestampBoundStore;

/// A contiguous inclusive range of freshly issued timestamps.
///
/// Every timestamp in the range belongs to the caller; none will ever
/// be issued again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampRange {
    lower: Timestamp,
    upper: Timestamp,
}

impl TimestampRange {
    /// Creates an inclusive range.
    #[must_use]
    pub fn new(lower: Timestamp, upper: Timestamp) -> Self {
        debug_assert!(lower <= upper, "inverted timestamp range");
        Self { lower, upper }
    }

    /// The smallest timestamp in the range.
    #[inline]
    #[must_use]
    pub fn lower(&self) -> Timestamp {
        self.lower
    }

    /// The largest timestamp in the range.
    #[inline]
    #[must_use]
    pub fn upper(&self) -> Timestamp {
        self.upper
    }

    /// Number of timestamps in the range.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.upper.as_u64() - self.lower.as_u64() + 1
    }

    /// Iterates the range in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Timestamp> {
        (self.lower.as_u64()..=self.upper.as_u64()).map(Timestamp::new)
    }
}

/// Issues cluster-wide unique, strictly increasing timestamps.
pub trait TimestampService: Send + Sync {
    /// Issues one fresh timestamp.
    ///
    /// # Errors
    ///
    /// Fails when this node is not the leader or the bound store does.
    fn fresh_timestamp(&self) -> MeridianResult<Timestamp> {
        self.fresh_timestamps(1).map(|range| range.lower())
    }

    /// Issues a contiguous range of `count` fresh timestamps.
    ///
    /// `count` is clamped to a per-request maximum; the returned range
    /// may be smaller than asked for and callers must check its size.
    ///
    /// # Errors
    ///
    /// Rejects `count == 0`; otherwise fails as [`fresh_timestamp`]
    /// does.
    ///
    /// [`fresh_timestamp`]: TimestampService::fresh_timestamp
    fn fresh_timestamps(&self, count: u64) -> MeridianResult<TimestampRange>;

    /// Advances the oracle so that every future timestamp is greater
    /// than `target`. A target at or below the current state is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Fails when this node is not the leader or the bound store does.
    fn fast_forward(&self, target: Timestamp) -> MeridianResult<()>;
}

struct Allocator {
    last_returned: u64,
    upper_limit: u64,
}

/// Timestamp service over a durable bound store.
///
/// A fresh instance starts issuing strictly above the limit it reads
/// back, so whatever part of the previous instance's buffer went
/// unused is discarded rather than reissued.
pub struct PersistentTimestampService {
    store: Arc<dyn TimestampBoundStore>,
    leadership: Arc<LeadershipState>,
    allocator: Mutex<Allocator>,
}

impl PersistentTimestampService {
    /// Creates the service, reading the persisted limit back.
    ///
    /// # Errors
    ///
    /// Fails when the bound store cannot be read.
    pub fn create(
        store: Arc<dyn TimestampBoundStore>,
        leadership: Arc<LeadershipState>,
    ) -> MeridianResult<Self> {
        let limit = store.get_upper_limit()?;
        info!(limit = %limit, "timestamp service resuming above the persisted limit");
        Ok(Self {
            store,
            leadership,
            allocator: Mutex::new(Allocator {
                last_returned: limit.as_u64(),
                upper_limit: limit.as_u64(),
            }),
        })
    }
}

impl TimestampService for PersistentTimestampService {
    fn fresh_timestamps(&self, count: u64) -> MeridianResult<TimestampRange> {
        self.leadership.require_leader()?;
        if count == 0 {
            return Err(MeridianError::invalid_argument(
                "cannot request zero timestamps",
            ));
        }
        let count = count.min(MAX_TIMESTAMPS_PER_REQUEST);

        let mut allocator = self.allocator.lock();
        let target = allocator
            .last_returned
            .checked_add(count)
            .ok_or_else(|| MeridianError::internal("timestamp space exhausted"))?;

        // Issued values never pass the persisted limit; raise it first.
        if target > allocator.upper_limit {
            let new_limit = target + TIMESTAMP_ALLOCATION_BUFFER;
            self.store.store_upper_limit(Timestamp::new(new_limit))?;
            allocator.upper_limit = new_limit;
            debug!(new_limit, "raised the persisted timestamp limit");
        }

        let lower = Timestamp::new(allocator.last_returned + 1);
        allocator.last_returned = target;
        Ok(TimestampRange::new(lower, Timestamp::new(target)))
    }

    fn fast_forward(&self, target: Timestamp) -> MeridianResult<()> {
        self.leadership.require_leader()?;
        let mut allocator = self.allocator.lock();
        if target.as_u64() > allocator.upper_limit {
            let new_limit = target.as_u64() + TIMESTAMP_ALLOCATION_BUFFER;
            self.store.store_upper_limit(Timestamp::new(new_limit))?;
            allocator.upper_limit = new_limit;
        }
        if target.as_u64() > allocator.last_returned {
            allocator.last_returned = target.as_u64();
        }
        info!(target = %target, "fast-forwarded the timestamp oracle");
        Ok(())
    }
}
