//! Requests accepted from the management surface

use ism_util::PolicyId;
use serde::{Deserialize, Serialize};

/// Restricts a change policy request to indices currently in a given state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateFilter {
    pub state: String,
}

/// A request to swap the policy of a managed index at the next safe boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangePolicy {
    pub policy_id: PolicyId,

    /// State of the new policy to start in; the new policy's default state if absent
    #[serde(default)]
    pub state: Option<String>,

    /// Only apply when the index is currently in one of these states
    #[serde(default)]
    pub include: Vec<StateFilter>,
}

impl ChangePolicy {
    pub fn new(policy_id: impl Into<PolicyId>) -> Self {
        Self {
            policy_id: policy_id.into(),
            state: None,
            include: Vec::new(),
        }
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn including(mut self, state: impl Into<String>) -> Self {
        self.include.push(StateFilter {
            state: state.into(),
        });
        self
    }

    /// Whether the state filters admit an index currently in `current_state`
    pub fn admits(&self, current_state: Option<&str>) -> bool {
        if self.include.is_empty() {
            return true;
        }
        match current_state {
            Some(state) => self.include.iter().any(|f| f.state == state),
            None => false,
        }
    }
}

/// Outcome of a management request that touches several indices
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateSummary {
    pub updated_indices: usize,
    pub failed_indices: Vec<FailedIndex>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedIndex {
    pub index: String,
    pub reason: String,
}
