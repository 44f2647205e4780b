//! Metadata history entries

use chrono::{DateTime, Utc};
use ism_api::ManagedIndexMetaData;
use ism_util::PolicyId;
use serde::{Deserialize, Serialize};

/// Immutable snapshot of an index's metadata at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Unique entry ID, assigned by the store
    #[serde(default)]
    pub id: i64,

    pub index: String,
    pub index_uuid: String,
    pub policy_id: PolicyId,
    pub timestamp: DateTime<Utc>,
    pub metadata: ManagedIndexMetaData,
}

impl HistoryEntry {
    pub fn new(metadata: ManagedIndexMetaData, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            index: metadata.index.clone(),
            index_uuid: metadata.index_uuid.clone(),
            policy_id: metadata.policy_id.clone(),
            timestamp,
            metadata,
        }
    }
}
