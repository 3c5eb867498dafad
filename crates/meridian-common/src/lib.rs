//! # meridian-common
//!
//! Common types, errors, and utilities for Meridian.
//!
//! This crate provides the foundational types and abstractions used across
//! all Meridian components. It includes:
//!
//! - **Types**: Core identifiers (`Timestamp`, `NodeId`, `LockToken`), cells,
//!   values, and table references
//! - **Errors**: Unified error handling with `MeridianError`
//! - **Leadership**: The shared leader/follower role state checked by every
//!   oracle and lock entry point
//! - **Constants**: System-wide constants and limits
//!
//! ## Example
//!
//! ```rust
//! use meridian_common::types::{Cell, TableRef, Timestamp, Value};
//! use meridian_common::error::MeridianResult;
//!
//! fn example() -> MeridianResult<()> {
//!     let table = TableRef::from_qualified_name("accounts.balances")?;
//!     let cell = Cell::new(&b"row1"[..], &b"col1"[..]);
//!     let value = Value::from_bytes(b"world");
//!     let ts = Timestamp::new(42);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod constants;
pub mod error;
pub mod leadership;
pub mod types;

// Re-export commonly used items at the crate root
pub use constants::*;
pub use error::{ErrorCode, MeridianError, MeridianResult};
pub use leadership::{LeadershipState, Role};
pub use types::{Cell, ClientId, LockToken, NodeId, TableRef, Timestamp, Value};
