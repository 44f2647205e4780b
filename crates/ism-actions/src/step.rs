//! The step contract: what the runner hands a step and what it gets back

use chrono::{DateTime, Utc};
use ism_api::{ActionProperties, ManagedIndexMetaData, StepStatus, info_message};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{ClusterClient, ClusterError};

/// Everything a step may look at or act through during one tick
pub struct StepContext<'a> {
    pub index: &'a str,
    pub index_uuid: &'a str,
    pub cluster: &'a dyn ClusterClient,
    pub metadata: &'a ManagedIndexMetaData,
    pub now: DateTime<Utc>,
}

impl StepContext<'_> {
    /// Properties recorded by earlier steps of the current action
    pub fn properties(&self) -> ActionProperties {
        self.metadata
            .action
            .as_ref()
            .map(|a| a.properties.clone())
            .unwrap_or_default()
    }
}

/// Outcome of one `execute` call
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub status: StepStatus,
    pub info: Map<String, Value>,

    /// Set once the index has been rolled over
    pub rolled_over: bool,
}

impl StepResult {
    pub fn new(status: StepStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            info: info_message(message),
            rolled_over: false,
        }
    }

    pub fn completed(message: impl Into<String>) -> Self {
        Self::new(StepStatus::Completed, message)
    }

    pub fn running(message: impl Into<String>) -> Self {
        Self::new(StepStatus::Running, message)
    }

    pub fn condition_not_met(message: impl Into<String>) -> Self {
        Self::new(StepStatus::ConditionNotMet, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(StepStatus::Failed, message)
    }

    pub fn with_info(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.info.insert(key.to_string(), value.into());
        self
    }
}

/// Step failures that must not consume the action's retry budget
#[derive(Debug, Error)]
pub enum StepError {
    /// The cluster could not be reached; abandon the tick
    #[error("Transient cluster error: {0}")]
    Transient(ClusterError),

    /// The action cannot apply to this index; retrying will not help
    #[error("{0}")]
    Validation(String),
}

pub type StepOutcome<T> = Result<T, StepError>;

/// Turn a cluster error into a step outcome: transient errors abort the
/// tick, everything else is a semantic failure of the step.
pub fn classify(error: ClusterError, message: &str) -> StepOutcome<StepResult> {
    if error.is_transient() {
        Err(StepError::Transient(error))
    } else {
        Ok(StepResult::failed(message).with_info("cause", error.to_string()))
    }
}

/// Transient errors abort; anything else is returned for the caller to judge
pub(crate) fn transient_or<T>(result: Result<T, ClusterError>) -> StepOutcome<Result<T, ClusterError>> {
    match result {
        Err(e) if e.is_transient() => Err(StepError::Transient(e)),
        other => Ok(other),
    }
}
