//! Lock requests and outcomes.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use meridian_common::types::{ClientId, LockToken, TableRef};
use meridian_common::{
    MeridianError, MeridianResult, DEFAULT_LEASE_DURATION_MS, DEFAULT_LOCK_TIMEOUT_MS,
};

/// An opaque lock name.
///
/// Descriptors carry no structure the service interprets; equality is
/// bytewise. The conventional form for row locks is
/// `<qualified table name>/<row bytes>`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockDescriptor(Bytes);

impl LockDescriptor {
    /// Creates a descriptor from raw bytes.
    #[must_use]
    pub fn new(name: impl Into<Bytes>) -> Self {
        Self(name.into())
    }

    /// Creates the descriptor guarding one row of one table.
    #[must_use]
    pub fn from_row(table: &TableRef, row: &[u8]) -> Self {
        let mut name = Vec::with_capacity(table.qualified_name().len() + 1 + row.len());
        name.extend_from_slice(table.qualified_name().as_bytes());
        name.push(b'/');
        name.extend_from_slice(row);
        Self(Bytes::from(name))
    }

    /// The descriptor's raw bytes.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for LockDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LockDescriptor({})", String::from_utf8_lossy(&self.0))
    }
}

/// A request to take a set of locks.
///
/// The descriptor set is held in canonical order (sorted, deduplicated)
/// and granted all at once: a request never holds a subset while
/// waiting for the rest.
#[derive(Debug, Clone)]
pub struct LockRequest {
    client: ClientId,
    descriptors: Vec<LockDescriptor>,
    acquire_timeout: Duration,
    lease_duration: Duration,
}

impl LockRequest {
    /// Creates a request with the default timeout and lease.
    ///
    /// # Errors
    ///
    /// Rejects an empty descriptor set.
    pub fn new(client: ClientId, mut descriptors: Vec<LockDescriptor>) -> MeridianResult<Self> {
        if descriptors.is_empty() {
            return Err(MeridianError::invalid_argument(
                "lock request needs at least one descriptor",
            ));
        }
        descriptors.sort_unstable();
        descriptors.dedup();
        Ok(Self {
            client,
            descriptors,
            acquire_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            lease_duration: Duration::from_millis(DEFAULT_LEASE_DURATION_MS),
        })
    }

    /// Overrides how long the acquire may block.
    #[must_use]
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Overrides the lease granted on success.
    #[must_use]
    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    /// The requesting client.
    #[must_use]
    pub fn client(&self) -> &ClientId {
        &self.client
    }

    /// The locks being requested, in canonical order.
    #[must_use]
    pub fn descriptors(&self) -> &[LockDescriptor] {
        &self.descriptors
    }

    /// How long the acquire may block.
    #[must_use]
    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    /// The lease granted on success.
    #[must_use]
    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }
}

/// The outcome of a lock acquisition.
///
/// Timing out is an expected outcome under contention, not an error;
/// callers decide whether to retry, back off, or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Every requested lock is now held under this token.
    Granted(LockToken),
    /// The locks could not all be taken before the timeout.
    TimedOut,
}

impl AcquireOutcome {
    /// True when the locks were granted.
    #[must_use]
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }

    /// The granted token, if any.
    #[must_use]
    pub fn token(&self) -> Option<LockToken> {
        match self {
            Self::Granted(token) => Some(*token),
            Self::TimedOut => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str) -> LockDescriptor {
        LockDescriptor::new(name.as_bytes().to_vec())
    }

    #[test]
    fn test_request_canonicalizes_descriptors() {
        let request = LockRequest::new(
            ClientId::new("txn"),
            vec![descriptor("b"), descriptor("a"), descriptor("b")],
        )
        .unwrap();
        assert_eq!(
            request.descriptors(),
            &[descriptor("a"), descriptor("b")]
        );
    }

    #[test]
    fn test_empty_request_rejected() {
        assert!(LockRequest::new(ClientId::new("txn"), Vec::new()).is_err());
    }

    #[test]
    fn test_builder_overrides() {
        let request = LockRequest::new(ClientId::new("txn"), vec![descriptor("a")])
            .unwrap()
            .with_acquire_timeout(Duration::from_millis(5))
            .with_lease_duration(Duration::from_millis(70));
        assert_eq!(request.acquire_timeout(), Duration::from_millis(5));
        assert_eq!(request.lease_duration(), Duration::from_millis(70));
    }

    #[test]
    fn test_row_descriptor_includes_table() {
        let table = TableRef::create("accounts", "balances").unwrap();
        let descriptor = LockDescriptor::from_row(&table, b"alice");
        assert_eq!(descriptor.as_bytes(), b"accounts.balances/alice");
    }

    #[test]
    fn test_outcome_accessors() {
        let granted = AcquireOutcome::Granted(LockToken::new(7));
        assert!(granted.is_granted());
        assert_eq!(granted.token(), Some(LockToken::new(7)));
        assert!(!AcquireOutcome::TimedOut.is_granted());
        assert_eq!(AcquireOutcome::TimedOut.token(), None);
    }
}
