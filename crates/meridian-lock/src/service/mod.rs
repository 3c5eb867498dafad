//! The lease-based lock service.
//!
//! All locks live in process memory on the current leader. A request
//! names a set of descriptors and is granted atomically: either every
//! descriptor becomes held under one fresh token, or the caller keeps
//! waiting. Grants carry a lease; holders refresh the lease while they
//! work, and an expired lease makes the locks eligible for reaping at
//! the next contention point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use meridian_common::types::{ClientId, LockToken};
use meridian_common::{LeadershipState, MeridianError, MeridianResult};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::types::{AcquireOutcome, LockDescriptor, LockRequest};

/// Operation counters for one lock service instance.
#[derive(Debug, Default)]
pub struct LockStats {
    grants: AtomicU64,
    timeouts: AtomicU64,
    refreshes: AtomicU64,
    releases: AtomicU64,
    expirations: AtomicU64,
}

impl LockStats {
    fn record_grant(&self) {
        self.grants.fetch_add(1, Ordering::Relaxed);
    }

    fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_refresh(&self) {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
    }

    fn record_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    fn record_expiration(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of granted requests.
    pub fn grants(&self) -> u64 {
        self.grants.load(Ordering::Relaxed)
    }

    /// Number of requests that timed out waiting.
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Number of successful lease refreshes.
    pub fn refreshes(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// Number of explicit unlocks.
    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::Relaxed)
    }

    /// Number of tokens reaped after their lease ran out.
    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }
}

struct TokenEntry {
    client: ClientId,
    descriptors: Vec<LockDescriptor>,
    lease_duration: Duration,
    lease_expires: Instant,
}

#[derive(Default)]
struct LockTables {
    held: HashMap<LockDescriptor, LockToken>,
    tokens: HashMap<LockToken, TokenEntry>,
}

impl LockTables {
    /// Drops every token whose lease has run out and frees its locks.
    /// Returns how many tokens were reaped.
    fn reap_expired(&mut self, now: Instant, stats: &LockStats) -> usize {
        let expired: Vec<LockToken> = self
            .tokens
            .iter()
            .filter(|(_, entry)| entry.lease_expires <= now)
            .map(|(&token, _)| token)
            .collect();
        for token in &expired {
            if let Some(entry) = self.tokens.remove(token) {
                warn!(
                    token = %token,
                    client = %entry.client,
                    locks = entry.descriptors.len(),
                    "lock lease expired, reaping"
                );
                for descriptor in &entry.descriptors {
                    self.held.remove(descriptor);
                }
                stats.record_expiration();
            }
        }
        expired.len()
    }

    fn all_free(&self, descriptors: &[LockDescriptor]) -> bool {
        descriptors.iter().all(|d| !self.held.contains_key(d))
    }
}

/// Grants mutually exclusive leases over named lock descriptors.
///
/// Every entry point checks leadership first: a follower fails fast
/// with a typed not-leader error instead of granting locks the real
/// leader knows nothing about.
pub struct LockService {
    leadership: Arc<LeadershipState>,
    tables: Mutex<LockTables>,
    freed: Condvar,
    stats: LockStats,
}

impl LockService {
    /// Creates a lock service bound to the given leadership state.
    #[must_use]
    pub fn new(leadership: Arc<LeadershipState>) -> Self {
        Self {
            leadership,
            tables: Mutex::new(LockTables::default()),
            freed: Condvar::new(),
            stats: LockStats::default(),
        }
    }

    /// Operation counters for this service.
    pub fn stats(&self) -> &LockStats {
        &self.stats
    }

    /// Acquires every lock in the request, blocking until all are free
    /// at once or the acquire timeout passes.
    ///
    /// Timing out is reported through [`AcquireOutcome::TimedOut`], not
    /// an error: contention is expected and the caller chooses the
    /// retry policy.
    ///
    /// # Errors
    ///
    /// Fails fast when this node is not the leader.
    pub fn lock(&self, request: &LockRequest) -> MeridianResult<AcquireOutcome> {
        self.leadership.require_leader()?;
        let deadline = Instant::now() + request.acquire_timeout();

        let mut tables = self.tables.lock();
        loop {
            let now = Instant::now();
            if tables.reap_expired(now, &self.stats) > 0 {
                self.freed.notify_all();
            }

            if tables.all_free(request.descriptors()) {
                let token = Self::fresh_token(&tables);
                for descriptor in request.descriptors() {
                    tables.held.insert(descriptor.clone(), token);
                }
                tables.tokens.insert(
                    token,
                    TokenEntry {
                        client: request.client().clone(),
                        descriptors: request.descriptors().to_vec(),
                        lease_duration: request.lease_duration(),
                        lease_expires: now + request.lease_duration(),
                    },
                );
                self.stats.record_grant();
                debug!(
                    token = %token,
                    client = %request.client(),
                    locks = request.descriptors().len(),
                    "locks granted"
                );
                return Ok(AcquireOutcome::Granted(token));
            }

            if now >= deadline || self.freed.wait_until(&mut tables, deadline).timed_out() {
                self.stats.record_timeout();
                debug!(client = %request.client(), "lock acquisition timed out");
                return Ok(AcquireOutcome::TimedOut);
            }
        }
    }

    /// Extends the lease of a held token by its original duration.
    ///
    /// # Errors
    ///
    /// `LockTokenNotHeld` when the token expired or was released, and
    /// the usual not-leader errors.
    pub fn refresh(&self, token: LockToken) -> MeridianResult<()> {
        self.leadership.require_leader()?;
        let mut tables = self.tables.lock();
        let now = Instant::now();
        if tables.reap_expired(now, &self.stats) > 0 {
            self.freed.notify_all();
        }

        match tables.tokens.get_mut(&token) {
            Some(entry) => {
                entry.lease_expires = now + entry.lease_duration;
                self.stats.record_refresh();
                Ok(())
            }
            None => Err(MeridianError::LockTokenNotHeld { token }),
        }
    }

    /// Releases every lock held under the token.
    ///
    /// # Errors
    ///
    /// `LockTokenNotHeld` when the token expired or was already
    /// released, and the usual not-leader errors.
    pub fn unlock(&self, token: LockToken) -> MeridianResult<()> {
        self.leadership.require_leader()?;
        let mut tables = self.tables.lock();
        let Some(entry) = tables.tokens.remove(&token) else {
            return Err(MeridianError::LockTokenNotHeld { token });
        };
        for descriptor in &entry.descriptors {
            tables.held.remove(descriptor);
        }
        self.stats.record_release();
        self.freed.notify_all();
        debug!(token = %token, client = %entry.client, "locks released");
        Ok(())
    }

    /// Whether a token is currently held and unexpired.
    #[must_use]
    pub fn holds(&self, token: LockToken) -> bool {
        let tables = self.tables.lock();
        tables
            .tokens
            .get(&token)
            .is_some_and(|entry| entry.lease_expires > Instant::now())
    }

    /// Number of live tokens.
    #[must_use]
    pub fn token_count(&self) -> usize {
        self.tables.lock().tokens.len()
    }

    fn fresh_token(tables: &LockTables) -> LockToken {
        loop {
            let token = LockToken::new(rand::random::<u64>());
            if !tables.tokens.contains_key(&token) {
                return token;
            }
        }
    }
}
