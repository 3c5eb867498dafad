//! Type definitions for Meridian.
//!
//! This module contains all core type definitions used across the
//! transaction layer.

mod cells;
mod ids;
mod tables;
mod timestamps;

pub use cells::{Cell, Value};
pub use ids::{ClientId, LockToken, NodeId};
pub use tables::TableRef;
pub use timestamps::Timestamp;
