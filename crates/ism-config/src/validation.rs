//! Policy and settings validation

use crate::action::{ActionConfig, ActionKind};
use crate::schema::{RawPolicy, RawSettings, RawState};
use ism_util::TimeValue;
use std::collections::HashSet;
use thiserror::Error;

/// Longest retry delay or action timeout a policy may ask for
pub const MAX_ACTION_DURATION: TimeValue = TimeValue::from_days(3650);

/// Validation error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Policy must define at least one state")]
    NoStates,

    #[error("Duplicate state name: {0}")]
    DuplicateStateName(String),

    #[error("Default state '{0}' does not exist")]
    UnknownDefaultState(String),

    #[error("State '{state}': transition targets unknown state '{target}'")]
    UnknownTransitionTarget { state: String, target: String },

    #[error("State '{state}': transition to '{target}' must have exactly one condition, found {count}")]
    ConditionCount {
        state: String,
        target: String,
        count: usize,
    },

    #[error("State '{state}': unconditional transition to '{target}' must be the last transition")]
    UnconditionalNotLast { state: String, target: String },

    #[error("State '{state}', action '{action}': {message}")]
    ActionError {
        state: String,
        action: String,
        message: String,
    },

    #[error("ISM template {position}: {message}")]
    TemplateError { position: usize, message: String },

    #[error("Settings error: {0}")]
    SettingsError(String),
}

/// Validate a raw policy
pub fn validate_policy(policy: &RawPolicy) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if policy.states.is_empty() {
        errors.push(ValidationError::NoStates);
        return errors;
    }

    let mut names = HashSet::new();
    for state in &policy.states {
        if !names.insert(state.name.as_str()) {
            errors.push(ValidationError::DuplicateStateName(state.name.clone()));
        }
    }

    if !names.contains(policy.default_state.as_str()) {
        errors.push(ValidationError::UnknownDefaultState(policy.default_state.clone()));
    }

    for state in &policy.states {
        errors.extend(validate_transitions(state, &names));
        for action in &state.actions {
            errors.extend(validate_action(action, &state.name));
        }
    }

    for (position, template) in policy.ism_template.iter().enumerate() {
        if template.index_patterns.is_empty() {
            errors.push(ValidationError::TemplateError {
                position,
                message: "index_patterns cannot be empty".into(),
            });
        }
        for pattern in &template.index_patterns {
            if pattern.is_empty() || pattern.starts_with('.') {
                errors.push(ValidationError::TemplateError {
                    position,
                    message: format!("invalid index pattern '{}'", pattern),
                });
            }
        }
    }

    errors
}

fn validate_transitions(state: &RawState, names: &HashSet<&str>) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let last = state.transitions.len().saturating_sub(1);

    for (position, transition) in state.transitions.iter().enumerate() {
        if !names.contains(transition.state_name.as_str()) {
            errors.push(ValidationError::UnknownTransitionTarget {
                state: state.name.clone(),
                target: transition.state_name.clone(),
            });
        }

        match &transition.conditions {
            Some(conditions) if conditions.count() != 1 => {
                errors.push(ValidationError::ConditionCount {
                    state: state.name.clone(),
                    target: transition.state_name.clone(),
                    count: conditions.count(),
                });
            }
            Some(conditions) => {
                if let Some(script) = &conditions.script
                    && script.source.trim().is_empty()
                {
                    errors.push(ValidationError::ConditionCount {
                        state: state.name.clone(),
                        target: transition.state_name.clone(),
                        count: 0,
                    });
                }
            }
            None if position != last => {
                errors.push(ValidationError::UnconditionalNotLast {
                    state: state.name.clone(),
                    target: transition.state_name.clone(),
                });
            }
            None => {}
        }
    }

    errors
}

fn validate_action(action: &ActionConfig, state: &str) -> Vec<ValidationError> {
    let mut messages = Vec::new();

    match &action.kind {
        ActionKind::ForceMerge(p) => {
            if p.max_num_segments == 0 {
                messages.push("max_num_segments must be greater than 0".to_string());
            }
        }
        ActionKind::Shrink(p) => {
            let set = [
                p.num_new_shards.is_some(),
                p.max_shard_size.is_some(),
                p.percentage_of_source_shards.is_some(),
            ]
            .iter()
            .filter(|s| **s)
            .count();
            if set != 1 {
                messages.push(
                    "exactly one of num_new_shards, max_shard_size, percentage_of_source_shards must be set"
                        .to_string(),
                );
            }
            if p.num_new_shards == Some(0) {
                messages.push("num_new_shards must be greater than 0".to_string());
            }
            if p.max_shard_size.is_some_and(|s| s.as_u64() == 0) {
                messages.push("max_shard_size must be greater than 0".to_string());
            }
            if let Some(pct) = p.percentage_of_source_shards
                && !(pct > 0.0 && pct < 1.0)
            {
                messages.push("percentage_of_source_shards must be between 0 and 1".to_string());
            }
        }
        ActionKind::Snapshot(p) => {
            if p.repository.is_empty() {
                messages.push("repository cannot be empty".to_string());
            }
            if p.snapshot.is_empty() {
                messages.push("snapshot cannot be empty".to_string());
            }
        }
        ActionKind::Allocation(p) => {
            if p.require.is_empty() && p.include.is_empty() && p.exclude.is_empty() {
                messages.push("at least one of require, include, exclude must be set".to_string());
            }
        }
        ActionKind::Rollover(_)
        | ActionKind::Delete(_)
        | ActionKind::ReplicaCount(_)
        | ActionKind::ReadOnly(_)
        | ActionKind::ReadWrite(_)
        | ActionKind::IndexPriority(_)
        | ActionKind::Open(_)
        | ActionKind::Close(_) => {}
    }

    if action.retry.delay.as_duration().is_zero() && action.retry.count > 0 {
        messages.push("retry delay must be greater than 0".to_string());
    }
    if action.retry.delay > MAX_ACTION_DURATION {
        messages.push(format!("retry delay must be at most {}", MAX_ACTION_DURATION));
    }
    if action.timeout.is_some_and(|t| t.as_duration().is_zero()) {
        messages.push("timeout must be greater than 0".to_string());
    }
    if action.timeout.is_some_and(|t| t > MAX_ACTION_DURATION) {
        messages.push(format!("timeout must be at most {}", MAX_ACTION_DURATION));
    }

    messages
        .into_iter()
        .map(|message| ValidationError::ActionError {
            state: state.to_string(),
            action: action.name().to_string(),
            message,
        })
        .collect()
}

/// Validate raw daemon settings
pub fn validate_settings(settings: &RawSettings) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if let Some(jitter) = settings.jobs.jitter
        && !(0.0..1.0).contains(&jitter)
    {
        errors.push(ValidationError::SettingsError(format!(
            "jobs.jitter must be in [0, 1), got {}",
            jitter
        )));
    }

    for (name, value) in [
        ("jobs.interval_seconds", settings.jobs.interval_seconds),
        ("jobs.sweep_interval_seconds", settings.jobs.sweep_interval_seconds),
        ("jobs.lock_duration_seconds", settings.jobs.lock_duration_seconds),
        ("cluster.request_timeout_seconds", settings.cluster.request_timeout_seconds),
        ("cluster.monitor_interval_seconds", settings.cluster.monitor_interval_seconds),
    ] {
        if value == Some(0) {
            errors.push(ValidationError::SettingsError(format!("{} must be greater than 0", name)));
        }
    }

    for (name, value, max) in [
        (
            "jobs.interval_seconds",
            settings.jobs.interval_seconds,
            crate::settings::MAX_JOB_INTERVAL_SECS,
        ),
        (
            "jobs.lock_duration_seconds",
            settings.jobs.lock_duration_seconds,
            crate::settings::MAX_LOCK_DURATION_SECS,
        ),
    ] {
        if let Some(value) = value
            && value > max
        {
            errors.push(ValidationError::SettingsError(format!(
                "{} must be at most {}, got {}",
                name, max, value
            )));
        }
    }

    let lock = settings
        .jobs
        .lock_duration_seconds
        .unwrap_or(crate::settings::DEFAULT_LOCK_DURATION_SECS);
    let timeout = settings
        .cluster
        .request_timeout_seconds
        .unwrap_or(crate::settings::DEFAULT_REQUEST_TIMEOUT_SECS);
    if lock <= timeout {
        errors.push(ValidationError::SettingsError(format!(
            "jobs.lock_duration_seconds ({}) must exceed cluster.request_timeout_seconds ({})",
            lock, timeout
        )));
    }

    if let Some(url) = &settings.cluster.url
        && !(url.starts_with("http://") || url.starts_with("https://"))
    {
        errors.push(ValidationError::SettingsError(format!(
            "cluster.url must start with http:// or https://, got '{}'",
            url
        )));
    }

    if settings.node.node_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
        errors.push(ValidationError::SettingsError("node.node_id cannot be empty".into()));
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> RawPolicy {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn valid_policy_passes() {
        let policy = parse(
            r#"{
                "default_state": "hot",
                "states": [
                    {"name": "hot", "actions": [{"rollover": {"min_size": "1gb"}}],
                     "transitions": [{"state_name": "delete", "conditions": {"min_index_age": "30d"}}]},
                    {"name": "delete", "actions": [{"delete": {}}]}
                ]
            }"#,
        );
        assert!(validate_policy(&policy).is_empty());
    }

    #[test]
    fn unconditional_transition_must_be_last() {
        let policy = parse(
            r#"{
                "default_state": "hot",
                "states": [
                    {"name": "hot", "transitions": [
                        {"state_name": "cold"},
                        {"state_name": "warm", "conditions": {"min_index_age": "7d"}}
                    ]},
                    {"name": "warm"},
                    {"name": "cold"}
                ]
            }"#,
        );
        let errors = validate_policy(&policy);
        assert_eq!(
            errors,
            vec![ValidationError::UnconditionalNotLast {
                state: "hot".into(),
                target: "cold".into()
            }]
        );
    }

    #[test]
    fn structural_errors_are_collected() {
        let policy = parse(
            r#"{
                "default_state": "missing",
                "states": [
                    {"name": "hot", "transitions": [
                        {"state_name": "nowhere", "conditions": {"min_index_age": "1d", "min_doc_count": 5}}
                    ]},
                    {"name": "hot"}
                ]
            }"#,
        );
        let errors = validate_policy(&policy);
        assert!(errors.contains(&ValidationError::DuplicateStateName("hot".into())));
        assert!(errors.contains(&ValidationError::UnknownDefaultState("missing".into())));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::UnknownTransitionTarget { .. })));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::ConditionCount { count: 2, .. })));
    }

    #[test]
    fn empty_policy_is_rejected() {
        let policy = parse(r#"{"default_state": "hot", "states": []}"#);
        assert_eq!(validate_policy(&policy), vec![ValidationError::NoStates]);
    }

    #[test]
    fn shrink_requires_exactly_one_sizing_param() {
        let policy = parse(
            r#"{
                "default_state": "warm",
                "states": [{"name": "warm", "actions": [{"shrink": {"num_new_shards": 1, "max_shard_size": "10gb"}}]}]
            }"#,
        );
        let errors = validate_policy(&policy);
        assert_eq!(errors.len(), 1);
        assert!(matches!(&errors[0], ValidationError::ActionError { action, .. } if action == "shrink"));
    }

    #[test]
    fn template_patterns_are_checked() {
        let policy = parse(
            r#"{
                "default_state": "hot",
                "states": [{"name": "hot"}],
                "ism_template": [{"index_patterns": [], "priority": 1}, {"index_patterns": [".hidden-*"]}]
            }"#,
        );
        let errors = validate_policy(&policy);
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn settings_bounds() {
        let raw: RawSettings = toml::from_str(
            r#"
                config_version = 1
                [jobs]
                jitter = 1.5
                interval_seconds = 0
                lock_duration_seconds = 10
                [cluster]
                request_timeout_seconds = 30
                url = "localhost:9200"
            "#,
        )
        .unwrap();
        let errors = validate_settings(&raw);
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn oversized_durations_are_rejected() {
        let policy = parse(
            r#"{
                "default_state": "warm",
                "states": [{"name": "warm", "actions": [
                    {"replica_count": {"number_of_replicas": 0},
                     "retry": {"count": 1, "backoff": "constant", "delay": "100000000d"}},
                    {"read_only": {}, "timeout": "4000d"},
                    {"read_write": {}, "timeout": "3650d",
                     "retry": {"count": 3, "backoff": "exponential", "delay": "3650d"}}
                ]}]
            }"#,
        );
        let errors = validate_policy(&policy);
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.to_string().contains("must be at most 3650d")));

        let raw: RawSettings = toml::from_str(
            r#"
                config_version = 1
                [jobs]
                interval_seconds = 31536000
                lock_duration_seconds = 9999999999
            "#,
        )
        .unwrap();
        assert_eq!(validate_settings(&raw).len(), 2);
    }

    #[test]
    fn default_settings_are_valid() {
        let raw: RawSettings = toml::from_str("config_version = 1").unwrap();
        assert!(validate_settings(&raw).is_empty());
    }
}
