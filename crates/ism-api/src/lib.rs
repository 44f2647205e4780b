//! Shared document types for ismd
//!
//! This crate defines the types exchanged between the engine, the store and
//! the management surface:
//! - Managed index metadata (the per-index execution cursor)
//! - Live index statistics
//! - Change policy requests
//! - Explain projections and validation results

mod metadata;
mod requests;
mod types;

pub use metadata::*;
pub use requests::*;
pub use types::*;

/// Current schema version written into every persisted document
pub const SCHEMA_VERSION: u32 = 1;

pub(crate) fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}
