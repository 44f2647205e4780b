//! Cluster client trait

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ism_api::IndexStats;
use ism_config::Script;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors from cluster operations
#[derive(Debug, Clone, Error)]
pub enum ClusterError {
    #[error("Cluster unavailable: {0}")]
    Unavailable(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The cluster understood the request and refused it
    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClusterError {
    /// Errors that say nothing about the request itself
    pub fn is_transient(&self) -> bool {
        matches!(self, ClusterError::Unavailable(_) | ClusterError::Timeout(_))
    }
}

pub type ClusterResult<T> = Result<T, ClusterError>;

impl From<ClusterError> for ism_util::IsmError {
    fn from(e: ClusterError) -> Self {
        match e {
            ClusterError::NotFound(msg) => ism_util::IsmError::IndexNotFound(msg),
            other => ism_util::IsmError::ClusterError(other.to_string()),
        }
    }
}

/// Index setting changes issued by settings steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingsUpdate {
    ReadOnly(bool),
    NumberOfReplicas(u32),
    Priority(u32),
    Allocation {
        #[serde(default)]
        require: BTreeMap<String, String>,
        #[serde(default)]
        include: BTreeMap<String, String>,
        #[serde(default)]
        exclude: BTreeMap<String, String>,
    },
}

/// A data node and its free disk space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    pub free_bytes: u64,
}

/// Progress of a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotState {
    InProgress,
    Success,
    Failed(String),
}

/// Index lifecycle events observed on the cluster
#[derive(Debug, Clone, PartialEq)]
pub enum IndexEvent {
    Created {
        index: String,
        uuid: String,
        creation_date: DateTime<Utc>,
    },
    Deleted {
        index: String,
        uuid: String,
    },
}

/// Cluster client trait - implemented by transport-specific adapters
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Current statistics of one index
    async fn index_stats(&self, index: &str) -> ClusterResult<IndexStats>;

    /// Statistics of every index in the cluster
    async fn list_indices(&self) -> ClusterResult<Vec<IndexStats>>;

    /// Roll `alias` over to a new write index; returns the new index name
    async fn rollover(&self, alias: &str, copy_alias: bool) -> ClusterResult<String>;

    async fn delete_index(&self, index: &str) -> ClusterResult<()>;

    async fn update_settings(&self, index: &str, update: &SettingsUpdate) -> ClusterResult<()>;

    /// Start a force merge; completion is observed through segment counts
    async fn force_merge(&self, index: &str, max_num_segments: u32) -> ClusterResult<()>;

    async fn list_nodes(&self) -> ClusterResult<Vec<NodeInfo>>;

    /// Whether a copy of every shard of `index` resides on `node`
    async fn shards_relocated(&self, index: &str, node: &str) -> ClusterResult<bool>;

    async fn shrink_index(&self, source: &str, target: &str, num_shards: u32) -> ClusterResult<()>;

    async fn create_snapshot(&self, repository: &str, snapshot: &str, index: &str) -> ClusterResult<()>;

    async fn snapshot_state(&self, repository: &str, snapshot: &str) -> ClusterResult<SnapshotState>;

    async fn open_index(&self, index: &str) -> ClusterResult<()>;

    async fn close_index(&self, index: &str) -> ClusterResult<()>;

    /// Evaluate a transition script against an index
    async fn evaluate_script(&self, index: &str, script: &Script) -> ClusterResult<bool>;

    /// Subscribe to index lifecycle events
    fn subscribe(&self) -> mpsc::UnboundedReceiver<IndexEvent>;

    /// Optional: check if the cluster connection is healthy
    fn is_healthy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ClusterError::Unavailable("down".into()).is_transient());
        assert!(ClusterError::Timeout("slow".into()).is_transient());
        assert!(!ClusterError::Rejected("no".into()).is_transient());
        assert!(!ClusterError::NotFound("gone".into()).is_transient());
    }
}
