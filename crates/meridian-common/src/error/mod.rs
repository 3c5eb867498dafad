//! Error handling for Meridian.
//!
//! This module provides a unified error type and result alias used
//! across all Meridian components.

mod core;

pub use core::{ErrorCode, MeridianError};

/// Result type alias for Meridian operations.
pub type MeridianResult<T> = std::result::Result<T, MeridianError>;
