//! Shared types for index statistics and explain projections

use chrono::{DateTime, Utc};
use ism_util::PolicyId;
use serde::{Deserialize, Serialize};

use crate::{ChangePolicy, ManagedIndexMetaData};

/// Whether an index is open for reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    #[default]
    Open,
    Close,
}

/// Cluster health of an index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IndexHealth {
    #[default]
    Green,
    Yellow,
    Red,
}

/// Point-in-time statistics of one index, as read from the cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub index: String,
    pub uuid: String,
    pub creation_date: DateTime<Utc>,

    #[serde(default)]
    pub doc_count: u64,

    /// Total store size including replicas
    #[serde(default)]
    pub size_bytes: u64,

    /// Store size of the largest primary shard
    #[serde(default)]
    pub largest_primary_shard_bytes: u64,

    #[serde(default = "default_one")]
    pub primary_shards: u32,

    #[serde(default)]
    pub replicas: u32,

    /// Highest segment count of any shard
    #[serde(default)]
    pub max_segments_per_shard: u32,

    #[serde(default)]
    pub state: IndexState,

    #[serde(default)]
    pub health: IndexHealth,

    #[serde(default)]
    pub read_only: bool,

    #[serde(default)]
    pub priority: Option<u32>,

    /// Alias this index rolls over through, from its index settings
    #[serde(default)]
    pub rollover_alias: Option<String>,

    /// Whether this index is the write index of its rollover alias
    #[serde(default)]
    pub is_write_index: bool,

    /// When the index was rolled over, if it has been
    #[serde(default)]
    pub rollover_date: Option<DateTime<Utc>>,
}

fn default_one() -> u32 {
    1
}

impl IndexStats {
    /// Minimal stats for a freshly created, empty index
    pub fn new(
        index: impl Into<String>,
        uuid: impl Into<String>,
        creation_date: DateTime<Utc>,
    ) -> Self {
        Self {
            index: index.into(),
            uuid: uuid.into(),
            creation_date,
            doc_count: 0,
            size_bytes: 0,
            largest_primary_shard_bytes: 0,
            primary_shards: 1,
            replicas: 0,
            max_segments_per_shard: 0,
            state: IndexState::Open,
            health: IndexHealth::Green,
            read_only: false,
            priority: None,
            rollover_alias: None,
            is_write_index: false,
            rollover_date: None,
        }
    }

    /// Age of the index at `now`; zero for creation dates in the future
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.creation_date).max(chrono::Duration::zero())
    }
}

/// Outcome of validating the current action against the current index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Passed,
    /// Not valid right now but may become valid (re-checked next tick)
    Revalidate,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub status: ValidationStatus,
    pub message: String,
}

impl ValidationResult {
    pub fn passed(message: impl Into<String>) -> Self {
        Self {
            status: ValidationStatus::Passed,
            message: message.into(),
        }
    }

    pub fn revalidate(message: impl Into<String>) -> Self {
        Self {
            status: ValidationStatus::Revalidate,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: ValidationStatus::Failed,
            message: message.into(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == ValidationStatus::Failed
    }
}

/// Read-only projection of one index's management status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplainIndex {
    pub index: String,
    pub index_uuid: Option<String>,
    pub policy_id: Option<PolicyId>,
    pub enabled: bool,
    pub metadata: Option<ManagedIndexMetaData>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_change_policy: Option<ChangePolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationResult>,
}

impl ExplainIndex {
    /// Projection for an index without a policy attached
    pub fn unmanaged(index: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            index_uuid: None,
            policy_id: None,
            enabled: false,
            metadata: None,
            pending_change_policy: None,
            validation: None,
        }
    }
}
