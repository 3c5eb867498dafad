//! Cluster-wide timestamp oracle.
//!
//! Every transaction start and commit draws a timestamp from this
//! service. Issued values are strictly increasing across the whole
//! cluster and never handed out twice, even across crashes and
//! leadership changes; gaps are allowed and common.
//!
//! The oracle keeps a persisted upper limit well ahead of the last
//! value it returned, so only one durable write is needed per million
//! timestamps. A restarted instance reads the limit back and resumes
//! strictly above it, discarding whatever was left of the buffer.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use meridian_common::LeadershipState;
//! use meridian_timestamp::{InMemoryTimestampBoundStore, PersistentTimestampService, TimestampService};
//!
//! let leadership = Arc::new(LeadershipState::new());
//! leadership.become_leader(1);
//! let service =
//!     PersistentTimestampService::create(Arc::new(InMemoryTimestampBoundStore::new()), leadership)
//!         .unwrap();
//!
//! let first = service.fresh_timestamp().unwrap();
//! let second = service.fresh_timestamp().unwrap();
//! assert!(second > first);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Durable stores for the timestamp upper limit.
pub mod bound;
/// The timestamp service itself.
pub mod service;

pub use bound::{
    InMemoryTimestampBoundStore, KvsTimestampBoundStore, PaxosTimestampBoundStore,
    TimestampBoundStore,
};
pub use service::{PersistentTimestampService, TimestampRange, TimestampService};
