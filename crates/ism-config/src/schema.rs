//! Raw schemas as authored: policy JSON documents and the daemon's TOML settings

use ism_util::{ByteSize, TimeValue};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::action::ActionConfig;

/// Raw policy as parsed from JSON (the body under the top-level `policy` key)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawPolicy {
    #[serde(default)]
    pub description: String,

    /// Policy schema version
    #[serde(default = "default_policy_schema_version")]
    pub schema_version: u32,

    pub default_state: String,

    #[serde(default)]
    pub states: Vec<RawState>,

    /// Index-pattern templates that attach this policy to new indices
    #[serde(default, deserialize_with = "one_or_many")]
    pub ism_template: Vec<RawIsmTemplate>,
}

fn default_policy_schema_version() -> u32 {
    crate::CURRENT_POLICY_SCHEMA_VERSION
}

/// Raw state definition
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawState {
    pub name: String,

    #[serde(default)]
    pub actions: Vec<ActionConfig>,

    #[serde(default)]
    pub transitions: Vec<RawTransition>,
}

/// Raw transition
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawTransition {
    pub state_name: String,

    #[serde(default)]
    pub conditions: Option<RawConditions>,
}

/// Transition conditions; exactly one may be set
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawConditions {
    pub min_index_age: Option<TimeValue>,
    pub min_doc_count: Option<u64>,
    pub min_size: Option<ByteSize>,
    pub min_rollover_age: Option<TimeValue>,
    pub script: Option<RawScript>,
}

impl RawConditions {
    pub fn count(&self) -> usize {
        [
            self.min_index_age.is_some(),
            self.min_doc_count.is_some(),
            self.min_size.is_some(),
            self.min_rollover_age.is_some(),
            self.script.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }
}

/// Free-form script condition, evaluated by the cluster
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RawScript {
    pub source: String,

    #[serde(default = "default_script_lang")]
    pub lang: String,
}

fn default_script_lang() -> String {
    "painless".to_string()
}

/// Raw ISM template
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawIsmTemplate {
    pub index_patterns: Vec<String>,

    #[serde(default)]
    pub priority: u32,
}

fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        Many(Vec<T>),
        One(T),
    }

    Ok(match Option::<OneOrMany<T>>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(one)) => vec![one],
        Some(OneOrMany::Many(many)) => many,
    })
}

/// Raw daemon settings as parsed from TOML
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawSettings {
    /// Settings schema version
    pub config_version: u32,

    #[serde(default)]
    pub node: RawNodeSettings,

    #[serde(default)]
    pub paths: RawPathSettings,

    #[serde(default)]
    pub cluster: RawClusterSettings,

    #[serde(default)]
    pub jobs: RawJobSettings,

    #[serde(default)]
    pub coordinator: RawCoordinatorSettings,

    #[serde(default)]
    pub history: RawHistorySettings,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawNodeSettings {
    /// Lock holder identity (default: random per process)
    pub node_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawPathSettings {
    /// Data directory for the document store
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawClusterSettings {
    /// Base URL of the cluster REST API
    pub url: Option<String>,

    pub request_timeout_seconds: Option<u64>,

    /// How often the index catalogue is polled for created/deleted indices
    pub monitor_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawJobSettings {
    /// Default interval between ticks of one index
    pub interval_seconds: Option<u64>,

    /// Fraction of the interval randomly shaved off each run
    pub jitter: Option<f64>,

    /// Lease duration of the per-index lock
    pub lock_duration_seconds: Option<u64>,

    /// How often the scheduler looks for due jobs
    pub sweep_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawCoordinatorSettings {
    /// Auto-attach policies to new indices through ISM templates
    pub template_matching: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawHistorySettings {
    pub enabled: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_policy_body() {
        let json = r#"{
            "description": "hot then delete",
            "default_state": "hot",
            "states": [
                {
                    "name": "hot",
                    "actions": [{"rollover": {"min_size": "1gb"}}],
                    "transitions": [{"state_name": "delete", "conditions": {"min_index_age": "30d"}}]
                },
                {"name": "delete", "actions": [{"delete": {}}]}
            ],
            "ism_template": {"index_patterns": ["logs-*"], "priority": 100}
        }"#;

        let raw: RawPolicy = serde_json::from_str(json).unwrap();
        assert_eq!(raw.states.len(), 2);
        assert_eq!(raw.ism_template.len(), 1);
        assert_eq!(raw.ism_template[0].priority, 100);
        let cond = raw.states[0].transitions[0].conditions.as_ref().unwrap();
        assert_eq!(cond.min_index_age, Some(TimeValue::from_days(30)));
        assert_eq!(cond.count(), 1);
    }

    #[test]
    fn parse_settings() {
        let toml_str = r#"
            config_version = 1

            [node]
            node_id = "node-a"

            [jobs]
            interval_seconds = 60
            jitter = 0.2
        "#;

        let settings: RawSettings = toml::from_str(toml_str).unwrap();
        assert_eq!(settings.node.node_id.as_deref(), Some("node-a"));
        assert_eq!(settings.jobs.interval_seconds, Some(60));
        assert!(settings.cluster.url.is_none());
    }
}
