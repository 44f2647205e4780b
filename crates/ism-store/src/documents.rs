//! Document kinds, versions and the lock lease document

use chrono::{DateTime, Utc};
use ism_util::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a persisted document; documents are keyed by (kind, id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocKind {
    /// Keyed by policy id
    Policy,
    /// Keyed by index name
    ManagedConfig,
    /// Keyed by index name
    Metadata,
    /// Keyed by index name
    Lock,
}

impl DocKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocKind::Policy => "policy",
            DocKind::ManagedConfig => "managed_config",
            DocKind::Metadata => "metadata",
            DocKind::Lock => "lock",
        }
    }
}

impl fmt::Display for DocKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-document version. `seq_no` comes from a store-wide counter, so it
/// increases strictly across every write, including delete-and-recreate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub seq_no: i64,
    pub primary_term: i64,
}

impl Version {
    pub fn new(seq_no: i64, primary_term: i64) -> Self {
        Self {
            seq_no,
            primary_term,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.seq_no, self.primary_term)
    }
}

/// A document together with the version it was read at
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: Version,
}

/// Precondition of a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCondition {
    /// The document must not exist
    Create,
    /// The document must exist at exactly this version
    Match(Version),
    /// Unconditional
    Any,
}

/// Lease preventing two nodes from driving the same index at once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockDocument {
    #[serde(default = "default_lock_schema_version")]
    pub schema_version: u32,

    pub index: String,
    pub holder: NodeId,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

fn default_lock_schema_version() -> u32 {
    ism_api::SCHEMA_VERSION
}

impl LockDocument {
    pub fn new(
        index: impl Into<String>,
        holder: NodeId,
        acquired_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            schema_version: ism_api::SCHEMA_VERSION,
            index: index.into(),
            holder,
            acquired_at,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
