//! # meridian-server
//!
//! Node configuration and service wiring.
//!
//! This crate turns a validated [`MeridianConfig`] and a key-value
//! store into a running [`MeridianRuntime`]: leader election and the
//! timestamp bound over their Paxos fleets, the lock service with
//! lease refresh, the transaction manager, and the sweeper with its
//! background loop. The runtime owns every background thread and
//! stops them all on shutdown.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Node configuration.
pub mod config;
/// Service wiring.
pub mod runtime;

pub use config::{
    validate_client_name, ClusterSection, LockSection, MeridianConfig, NodeSection, SweepSection,
    TransactionSection,
};
pub use runtime::MeridianRuntime;
