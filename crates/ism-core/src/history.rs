//! Metadata history
//!
//! Every metadata write that moves an index through its policy (a new
//! state, action or step status, or a change to the failed and completed
//! flags) is appended to the history log. Info-only updates are not.

use chrono::{DateTime, Utc};
use ism_api::ManagedIndexMetaData;
use ism_store::{HistoryEntry, Store, StoreResult};
use std::sync::Arc;
use tracing::warn;

pub struct HistoryWriter {
    store: Arc<dyn Store>,
    enabled: bool,
}

impl HistoryWriter {
    pub fn new(store: Arc<dyn Store>, enabled: bool) -> Self {
        Self { store, enabled }
    }

    /// Append `current` if it differs meaningfully from `previous`.
    ///
    /// History is best effort: a failed append is logged, never surfaced.
    pub fn record(
        &self,
        previous: Option<&ManagedIndexMetaData>,
        current: &ManagedIndexMetaData,
        now: DateTime<Utc>,
    ) {
        if !self.enabled {
            return;
        }
        if previous.is_some_and(|p| !is_milestone(p, current)) {
            return;
        }

        let entry = HistoryEntry::new(current.clone(), now);
        if let Err(e) = self.store.append_history(&entry) {
            warn!(index = %current.index, error = %e, "Failed to append metadata history");
        }
    }

    /// Most recent entries for an index, newest first
    pub fn recent(&self, index: &str, limit: usize) -> StoreResult<Vec<HistoryEntry>> {
        self.store.recent_history(index, limit)
    }
}

/// Whether the change from `previous` to `current` is worth a history entry
pub fn is_milestone(previous: &ManagedIndexMetaData, current: &ManagedIndexMetaData) -> bool {
    let action = |m: &ManagedIndexMetaData| m.action.as_ref().map(|a| (a.name.clone(), a.index, a.failed));
    let step = |m: &ManagedIndexMetaData| m.step.as_ref().map(|s| (s.name.clone(), s.status));

    previous.policy_id != current.policy_id
        || previous.state_name() != current.state_name()
        || action(previous) != action(current)
        || step(previous) != step(current)
        || previous.policy_retry_info.failed != current.policy_retry_info.failed
        || previous.policy_completed != current.policy_completed
        || previous.transition_to != current.transition_to
}
