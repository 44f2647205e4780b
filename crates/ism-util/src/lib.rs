//! Shared utilities for ismd
//!
//! This crate provides:
//! - ID types (PolicyId, NodeId)
//! - Time utilities (mockable wall clock, `TimeValue` durations such as "30d")
//! - Byte sizes such as "1gb"
//! - Error types
//! - Default paths for settings and data directories

mod error;
mod ids;
mod paths;
mod time;
mod units;

pub use error::*;
pub use ids::*;
pub use paths::*;
pub use time::*;
pub use units::*;
