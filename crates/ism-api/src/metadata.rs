//! Managed index metadata: the runtime cursor of one index through its policy

use chrono::{DateTime, Utc};
use ism_util::PolicyId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::default_schema_version;

/// Status of the step currently recorded in the metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Starting,
    Running,
    Completed,
    Failed,
    ConditionNotMet,
}

impl StepStatus {
    /// Completed and condition-not-met both let the action advance
    pub fn is_done(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::ConditionNotMet)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Starting => "STARTING",
            StepStatus::Running => "RUNNING",
            StepStatus::Completed => "COMPLETED",
            StepStatus::Failed => "FAILED",
            StepStatus::ConditionNotMet => "CONDITION_NOT_MET",
        };
        f.write_str(s)
    }
}

/// The state the index is in and when it entered it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMetaData {
    pub name: String,
    pub start_time: DateTime<Utc>,
}

/// Properties an action carries across ticks (and across nodes)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_num_segments: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shrink: Option<ShrinkProperties>,
}

impl ActionProperties {
    pub fn is_empty(&self) -> bool {
        self.max_num_segments.is_none() && self.snapshot_name.is_none() && self.shrink.is_none()
    }
}

/// Progress of a shrink action between its steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShrinkProperties {
    pub node_name: String,
    pub target_index_name: String,
    pub target_num_shards: u32,
}

/// The action currently being executed within the state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionMetaData {
    pub name: String,
    pub start_time: DateTime<Utc>,

    /// Position of the action within its state's action list
    pub index: usize,

    #[serde(default)]
    pub failed: bool,

    #[serde(default)]
    pub consumed_retries: u32,

    #[serde(default)]
    pub last_retry_time: Option<DateTime<Utc>>,

    /// The step must not be re-entered before this instant
    #[serde(default)]
    pub retry_after: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "ActionProperties::is_empty")]
    pub properties: ActionProperties,
}

impl ActionMetaData {
    pub fn new(name: impl Into<String>, index: usize, start_time: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            start_time,
            index,
            failed: false,
            consumed_retries: 0,
            last_retry_time: None,
            retry_after: None,
            properties: ActionProperties::default(),
        }
    }
}

/// The step currently recorded for the action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMetaData {
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub status: StepStatus,
}

impl StepMetaData {
    pub fn new(name: impl Into<String>, start_time: DateTime<Utc>, status: StepStatus) -> Self {
        Self {
            name: name.into(),
            start_time,
            status,
        }
    }
}

/// Whether the whole policy is halted on a failure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyRetryInfo {
    #[serde(default)]
    pub failed: bool,

    #[serde(default)]
    pub consumed_retries: u32,
}

/// Runtime cursor of one managed index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedIndexMetaData {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,

    pub index: String,
    pub index_uuid: String,
    pub policy_id: PolicyId,

    #[serde(default)]
    pub policy_seq_no: Option<i64>,

    #[serde(default)]
    pub policy_primary_term: Option<i64>,

    #[serde(default)]
    pub policy_completed: bool,

    #[serde(default)]
    pub rolled_over: bool,

    #[serde(default)]
    pub index_creation_date: Option<DateTime<Utc>>,

    /// Target state chosen by a satisfied transition, moved to on the next tick
    #[serde(default)]
    pub transition_to: Option<String>,

    #[serde(default)]
    pub state: Option<StateMetaData>,

    #[serde(default)]
    pub action: Option<ActionMetaData>,

    #[serde(default)]
    pub step: Option<StepMetaData>,

    #[serde(default)]
    pub policy_retry_info: PolicyRetryInfo,

    #[serde(default)]
    pub info: Map<String, Value>,
}

impl ManagedIndexMetaData {
    pub fn new(
        index: impl Into<String>,
        index_uuid: impl Into<String>,
        policy_id: PolicyId,
    ) -> Self {
        Self {
            schema_version: default_schema_version(),
            index: index.into(),
            index_uuid: index_uuid.into(),
            policy_id,
            policy_seq_no: None,
            policy_primary_term: None,
            policy_completed: false,
            rolled_over: false,
            index_creation_date: None,
            transition_to: None,
            state: None,
            action: None,
            step: None,
            policy_retry_info: PolicyRetryInfo::default(),
            info: Map::new(),
        }
    }

    /// Replace the info payload with a single human-readable message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.info = info_message(message);
        self
    }

    pub fn message(&self) -> Option<&str> {
        self.info.get("message").and_then(Value::as_str)
    }

    pub fn state_name(&self) -> Option<&str> {
        self.state.as_ref().map(|s| s.name.as_str())
    }

    pub fn step_status(&self) -> Option<StepStatus> {
        self.step.as_ref().map(|s| s.status)
    }

    pub fn is_failed(&self) -> bool {
        self.policy_retry_info.failed
    }

    /// Whether an action or step is mid-flight (started and not yet done)
    pub fn is_in_flight(&self) -> bool {
        match (&self.action, &self.step) {
            (Some(action), _) if action.failed => false,
            (Some(_), Some(step)) => !step.status.is_done(),
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

/// Build an info payload holding a single message
pub fn info_message(message: impl Into<String>) -> Map<String, Value> {
    let mut info = Map::new();
    info.insert("message".into(), Value::String(message.into()));
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn step_status_done_states() {
        assert!(StepStatus::Completed.is_done());
        assert!(StepStatus::ConditionNotMet.is_done());
        assert!(!StepStatus::Running.is_done());
        assert!(!StepStatus::Starting.is_done());
        assert!(!StepStatus::Failed.is_done());
        assert_eq!(StepStatus::ConditionNotMet.to_string(), "CONDITION_NOT_MET");
    }

    #[test]
    fn in_flight_tracks_action_and_step() {
        let mut meta = ManagedIndexMetaData::new("logs-000001", "uuid", PolicyId::new("p"));
        assert!(!meta.is_in_flight());

        meta.action = Some(ActionMetaData::new("rollover", 0, t0()));
        meta.step = Some(StepMetaData::new("attempt_rollover", t0(), StepStatus::Running));
        assert!(meta.is_in_flight());

        meta.step = Some(StepMetaData::new("attempt_rollover", t0(), StepStatus::Completed));
        assert!(!meta.is_in_flight());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let json = r#"{
            "index": "logs-000001",
            "index_uuid": "abc",
            "policy_id": "hot-delete",
            "some_future_field": {"nested": true},
            "state": {"name": "hot", "start_time": "2025-01-01T00:00:00Z", "extra": 1}
        }"#;

        let meta: ManagedIndexMetaData = serde_json::from_str(json).unwrap();
        assert_eq!(meta.schema_version, crate::SCHEMA_VERSION);
        assert_eq!(meta.state_name(), Some("hot"));
        assert!(!meta.policy_completed);
        assert!(meta.info.is_empty());
    }

    #[test]
    fn with_message_sets_info() {
        let meta = ManagedIndexMetaData::new("i", "u", PolicyId::new("p"))
            .with_message("Successfully initialized policy");
        assert_eq!(meta.message(), Some("Successfully initialized policy"));
    }
}
