//! Persistence layer for ismd
//!
//! Provides:
//! - Versioned documents (policies, managed index configs, metadata, locks)
//!   with optimistic concurrency on a `seq_no`/`primary_term` pair
//! - Append-only metadata history

mod documents;
mod history;
mod sqlite;
mod traits;

pub use documents::*;
pub use history::*;
pub use sqlite::*;
pub use traits::*;

use thiserror::Error;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// The document changed since it was read
    #[error("Version conflict on {kind} '{id}'")]
    VersionConflict { kind: DocKind, id: String },

    #[error("{kind} '{id}' already exists")]
    AlreadyExists { kind: DocKind, id: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Errors that say nothing about the documents themselves; the caller
    /// should give up on the current unit of work and try again later.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Io(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::VersionConflict { .. } | StoreError::AlreadyExists { .. }
        )
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                StoreError::Unavailable(e.to_string())
            }
            _ => StoreError::Database(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for ism_util::IsmError {
    fn from(e: StoreError) -> Self {
        if e.is_conflict() {
            ism_util::IsmError::VersionConflict(e.to_string())
        } else {
            ism_util::IsmError::StoreError(e.to_string())
        }
    }
}
