//! Lease-based named locks.
//!
//! Transactions take short-lived locks on the rows they are about to
//! commit, so that at most one writer runs the commit path for a row
//! at a time. Grants carry a lease; a holder that stops refreshing
//! (crashed, partitioned, paused) loses its locks when the lease runs
//! out, and the next waiter proceeds.
//!
//! Locks here are a throughput optimization, not the correctness
//! backstop. The commit-record check-and-set decides who actually
//! commits; these locks just keep losers from doing wasted work.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// The background lease refresher.
pub mod refresh;
/// The lock service.
pub mod service;
/// Lock requests, descriptors, and outcomes.
pub mod types;

pub use refresh::LockRefresher;
pub use service::{LockService, LockStats};
pub use types::{AcquireOutcome, LockDescriptor, LockRequest};
