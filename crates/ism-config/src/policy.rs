//! Validated policy structures and the two pure policy algorithms

use chrono::{DateTime, Utc};
use ism_api::{IndexStats, ManagedIndexMetaData};
use ism_util::{ByteSize, PolicyId, TimeValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::action::ActionConfig;
use crate::schema::{RawConditions, RawIsmTemplate, RawPolicy, RawScript, RawState, RawTransition};

/// Validated policy ready for use by the runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub policy_id: PolicyId,

    #[serde(default)]
    pub description: String,

    #[serde(default = "default_policy_schema_version")]
    pub schema_version: u32,

    pub last_updated_time: DateTime<Utc>,

    pub default_state: String,

    pub states: Vec<State>,

    #[serde(default)]
    pub ism_templates: Vec<IsmTemplate>,
}

fn default_policy_schema_version() -> u32 {
    crate::CURRENT_POLICY_SCHEMA_VERSION
}

impl Policy {
    /// Convert from raw policy (after validation)
    pub fn from_raw(policy_id: PolicyId, raw: RawPolicy, now: DateTime<Utc>) -> Self {
        Self {
            policy_id,
            description: raw.description,
            schema_version: raw.schema_version,
            last_updated_time: now,
            default_state: raw.default_state,
            states: raw.states.into_iter().map(State::from_raw).collect(),
            ism_templates: raw
                .ism_template
                .into_iter()
                .map(|t| IsmTemplate::from_raw(t, now))
                .collect(),
        }
    }

    /// Get state by name
    pub fn state(&self, name: &str) -> Option<&State> {
        self.states.iter().find(|s| s.name == name)
    }

    /// The state the policy starts in
    pub fn initial_state(&self) -> Option<&State> {
        self.state(&self.default_state)
    }

    /// Highest template priority matching the index, if any template matches
    pub fn template_priority_for(&self, index: &str, creation_date: DateTime<Utc>) -> Option<u32> {
        self.ism_templates
            .iter()
            .filter(|t| t.matches(index, creation_date))
            .map(|t| t.priority)
            .max()
    }
}

/// Named phase of an index's lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub name: String,

    #[serde(default)]
    pub actions: Vec<ActionConfig>,

    #[serde(default)]
    pub transitions: Vec<Transition>,
}

/// What the runner should do next within a state
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActionResolution<'a> {
    /// Run the action at `index`; `fresh` when it has not been started yet
    Action {
        index: usize,
        action: &'a ActionConfig,
        fresh: bool,
    },
    /// Every action has completed and transitions remain to be evaluated
    Transitions,
    /// Every action has completed and the state has no transitions
    Exhausted,
}

/// The metadata does not fit the policy it claims to follow
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("State '{0}' does not exist in the policy")]
    UnknownState(String),

    #[error("Action '{recorded}' at position {index} of state '{state}' does not match policy action '{expected}'")]
    ActionMismatch {
        state: String,
        index: usize,
        recorded: String,
        expected: String,
    },
}

impl State {
    fn from_raw(raw: RawState) -> Self {
        Self {
            name: raw.name,
            actions: raw.actions,
            transitions: raw.transitions.into_iter().map(Transition::from_raw).collect(),
        }
    }

    /// A state with no actions and no transitions ends the policy
    pub fn is_terminal(&self) -> bool {
        self.actions.is_empty() && self.transitions.is_empty()
    }

    /// Resolve the action to execute next from the action recorded in `metadata`.
    ///
    /// An action counts as finished once its last step is recorded as
    /// completed (or condition-not-met); a recorded position past the end of
    /// the action list means the state is exhausted.
    pub fn resolve_current_action(
        &self,
        metadata: &ManagedIndexMetaData,
    ) -> Result<ActionResolution<'_>, PolicyError> {
        let recorded = match &metadata.action {
            None => return Ok(self.resolve_from(0)),
            Some(recorded) => recorded,
        };

        let action = match self.actions.get(recorded.index) {
            Some(action) => action,
            None => return Ok(self.resolve_from(recorded.index)),
        };

        if action.name() != recorded.name {
            return Err(PolicyError::ActionMismatch {
                state: self.name.clone(),
                index: recorded.index,
                recorded: recorded.name.clone(),
                expected: action.name().to_string(),
            });
        }

        let finished = metadata
            .step
            .as_ref()
            .is_some_and(|step| step.status.is_done() && action.kind.is_last_step(&step.name));

        if finished && !recorded.failed {
            Ok(self.resolve_from(recorded.index + 1))
        } else {
            Ok(ActionResolution::Action {
                index: recorded.index,
                action,
                fresh: false,
            })
        }
    }

    fn resolve_from(&self, index: usize) -> ActionResolution<'_> {
        match self.actions.get(index) {
            Some(action) => ActionResolution::Action {
                index,
                action,
                fresh: true,
            },
            None if self.transitions.is_empty() => ActionResolution::Exhausted,
            None => ActionResolution::Transitions,
        }
    }

    /// First transition whose condition holds for the given inputs.
    ///
    /// Pure: the same inputs always select the same transition.
    pub fn evaluate_transitions(&self, inputs: &ConditionInputs<'_>) -> Option<&str> {
        self.transitions
            .iter()
            .find(|t| t.is_satisfied(inputs))
            .map(|t| t.state_name.as_str())
    }

    /// Script sources referenced by this state's transitions
    pub fn transition_scripts(&self) -> impl Iterator<Item = &Script> {
        self.transitions.iter().filter_map(|t| match &t.condition {
            Some(Condition::Script(script)) => Some(script),
            _ => None,
        })
    }
}

/// Conditional move to another state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub state_name: String,

    #[serde(default, rename = "conditions", skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

impl Transition {
    fn from_raw(raw: RawTransition) -> Self {
        Self {
            state_name: raw.state_name,
            condition: raw.conditions.and_then(Condition::from_raw),
        }
    }

    pub fn is_satisfied(&self, inputs: &ConditionInputs<'_>) -> bool {
        match &self.condition {
            None => true,
            Some(condition) => condition.evaluate(inputs),
        }
    }
}

/// Script evaluated by the cluster against the index
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Script {
    pub source: String,
    pub lang: String,
}

impl From<RawScript> for Script {
    fn from(raw: RawScript) -> Self {
        Self {
            source: raw.source,
            lang: raw.lang,
        }
    }
}

/// Condition guarding a transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    MinIndexAge(TimeValue),
    MinDocCount(u64),
    MinSize(ByteSize),
    MinRolloverAge(TimeValue),
    Script(Script),
}

/// Everything a condition may look at: a stats snapshot, the clock reading
/// of the tick, and the outcomes of the state's script conditions.
#[derive(Debug, Clone, Copy)]
pub struct ConditionInputs<'a> {
    pub stats: &'a IndexStats,
    pub now: DateTime<Utc>,
    pub script_outcomes: &'a BTreeMap<Script, bool>,
}

impl Condition {
    fn from_raw(raw: RawConditions) -> Option<Self> {
        if let Some(age) = raw.min_index_age {
            Some(Condition::MinIndexAge(age))
        } else if let Some(count) = raw.min_doc_count {
            Some(Condition::MinDocCount(count))
        } else if let Some(size) = raw.min_size {
            Some(Condition::MinSize(size))
        } else if let Some(age) = raw.min_rollover_age {
            Some(Condition::MinRolloverAge(age))
        } else {
            raw.script.map(|s| Condition::Script(s.into()))
        }
    }

    pub fn evaluate(&self, inputs: &ConditionInputs<'_>) -> bool {
        let stats = inputs.stats;
        match self {
            Condition::MinIndexAge(age) => stats.age(inputs.now) >= age.to_chrono(),
            Condition::MinDocCount(count) => stats.doc_count >= *count,
            Condition::MinSize(size) => stats.size_bytes >= size.as_u64(),
            Condition::MinRolloverAge(age) => stats
                .rollover_date
                .is_some_and(|rolled| inputs.now - rolled >= age.to_chrono()),
            Condition::Script(script) => {
                inputs.script_outcomes.get(script).copied().unwrap_or(false)
            }
        }
    }
}

/// Index-pattern template that attaches the policy to newly created indices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsmTemplate {
    pub index_patterns: Vec<String>,

    #[serde(default)]
    pub priority: u32,

    /// Only indices created at or after this instant are matched
    pub last_updated_time: DateTime<Utc>,
}

impl IsmTemplate {
    fn from_raw(raw: RawIsmTemplate, now: DateTime<Utc>) -> Self {
        Self {
            index_patterns: raw.index_patterns,
            priority: raw.priority,
            last_updated_time: now,
        }
    }

    pub fn matches(&self, index: &str, creation_date: DateTime<Utc>) -> bool {
        creation_date >= self.last_updated_time
            && self.index_patterns.iter().any(|p| wildcard_match(p, index))
    }
}

/// Match `text` against a pattern where `*` stands for any run of characters
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !text.starts_with(first) || text.len() < first.len() + last.len() {
        return false;
    }

    let mut rest = &text[first.len()..];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}
