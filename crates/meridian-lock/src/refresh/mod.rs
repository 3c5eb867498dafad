//! Background lease refreshing.
//!
//! Holders doing long-running work (the sweeper, a slow commit) must
//! not lose their locks just because they are busy. The refresher owns
//! that chore: registered tokens are refreshed on a fixed interval
//! from a dedicated thread, independent of whatever the holder itself
//! is doing. A token the service no longer recognizes is dropped from
//! the registry with a warning, since refreshing it again would never
//! succeed.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use meridian_common::types::LockToken;
use meridian_common::MeridianError;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::service::LockService;

struct Shared {
    tokens: Mutex<HashSet<LockToken>>,
    shutdown: Mutex<bool>,
    wake: Condvar,
}

/// Periodically refreshes registered lock tokens from a background
/// thread.
pub struct LockRefresher {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl LockRefresher {
    /// Starts the refresher thread.
    ///
    /// `interval` must be well below the lease duration of the tokens
    /// that will be registered, or leases expire between refreshes.
    #[must_use]
    pub fn start(service: Arc<LockService>, interval: Duration) -> Self {
        let shared = Arc::new(Shared {
            tokens: Mutex::new(HashSet::new()),
            shutdown: Mutex::new(false),
            wake: Condvar::new(),
        });

        let handle = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("lock-refresher".to_string())
                .spawn(move || Self::run(&service, &shared, interval))
                .expect("failed to spawn lock refresher thread")
        };

        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// Adds a token to the refresh set.
    pub fn register(&self, token: LockToken) {
        self.shared.tokens.lock().insert(token);
    }

    /// Removes a token from the refresh set, typically just before the
    /// holder unlocks it.
    pub fn deregister(&self, token: LockToken) {
        self.shared.tokens.lock().remove(&token);
    }

    /// Number of tokens currently being kept alive.
    #[must_use]
    pub fn registered_count(&self) -> usize {
        self.shared.tokens.lock().len()
    }

    /// Stops the refresher thread and waits for it to exit.
    pub fn shutdown(&mut self) {
        *self.shared.shutdown.lock() = true;
        self.shared.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    fn run(service: &LockService, shared: &Shared, interval: Duration) {
        loop {
            {
                let mut stopped = shared.shutdown.lock();
                if !*stopped {
                    shared.wake.wait_for(&mut stopped, interval);
                }
                if *stopped {
                    return;
                }
            }

            let snapshot: Vec<LockToken> = shared.tokens.lock().iter().copied().collect();
            for token in snapshot {
                match service.refresh(token) {
                    Ok(()) => {}
                    Err(MeridianError::LockTokenNotHeld { .. }) => {
                        warn!(token = %token, "token no longer held, dropping from refresh set");
                        shared.tokens.lock().remove(&token);
                    }
                    Err(err) => {
                        // Leadership hiccups are transient; keep the token
                        // and try again next interval.
                        debug!(token = %token, error = %err, "lease refresh failed");
                    }
                }
            }
        }
    }
}

impl Drop for LockRefresher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
