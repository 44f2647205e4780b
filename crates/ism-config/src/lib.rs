//! Policy model and configuration for ismd
//!
//! Supports:
//! - Policy JSON documents with states, actions, transitions and ISM templates
//! - Validation with clear error messages
//! - Managed index configs binding an index to a policy snapshot and schedule
//! - Versioned TOML daemon settings

mod action;
mod managed;
mod policy;
mod schema;
mod settings;
mod validation;

pub use action::*;
pub use managed::*;
pub use policy::*;
pub use schema::*;
pub use settings::*;
pub use validation::*;

use chrono::{DateTime, Utc};
use ism_util::PolicyId;
use std::path::Path;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Validation failed: {errors:?}")]
    ValidationFailed { errors: Vec<ValidationError> },

    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u32),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

impl From<ConfigError> for ism_util::IsmError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::ValidationFailed { errors } => ism_util::IsmError::ValidationError(
                errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            ),
            other => ism_util::IsmError::ConfigError(other.to_string()),
        }
    }
}

/// Current supported settings version
pub const CURRENT_CONFIG_VERSION: u32 = 1;

/// Current supported policy schema version
pub const CURRENT_POLICY_SCHEMA_VERSION: u32 = 1;

/// Parse and validate a policy JSON document.
///
/// Accepts both the `{"policy": {...}}` envelope and a bare policy body.
pub fn parse_policy(
    policy_id: impl Into<PolicyId>,
    content: &str,
    now: DateTime<Utc>,
) -> ConfigResult<Policy> {
    let mut value: serde_json::Value = serde_json::from_str(content)?;
    if let Some(body) = value.get_mut("policy").map(serde_json::Value::take) {
        value = body;
    }
    let raw: RawPolicy = serde_json::from_value(value)?;
    build_policy(policy_id.into(), raw, now)
}

/// Validate an already-deserialized policy and convert it
pub fn build_policy(policy_id: PolicyId, raw: RawPolicy, now: DateTime<Utc>) -> ConfigResult<Policy> {
    if raw.schema_version != CURRENT_POLICY_SCHEMA_VERSION {
        return Err(ConfigError::UnsupportedVersion(raw.schema_version));
    }

    let errors = validate_policy(&raw);
    if !errors.is_empty() {
        return Err(ConfigError::ValidationFailed { errors });
    }

    Ok(Policy::from_raw(policy_id, raw, now))
}

/// Load and validate a policy from a JSON file; the policy id is the file stem
pub fn load_policy(path: impl AsRef<Path>, now: DateTime<Utc>) -> ConfigResult<Policy> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let policy_id = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    parse_policy(policy_id, &content, now)
}

/// Load and validate daemon settings from a TOML file
pub fn load_settings(path: impl AsRef<Path>) -> ConfigResult<Settings> {
    let content = std::fs::read_to_string(path)?;
    parse_settings(&content)
}

/// Parse and validate daemon settings from a TOML string
pub fn parse_settings(content: &str) -> ConfigResult<Settings> {
    let raw: RawSettings = toml::from_str(content)?;

    if raw.config_version != CURRENT_CONFIG_VERSION {
        return Err(ConfigError::UnsupportedVersion(raw.config_version));
    }

    let errors = validate_settings(&raw);
    if !errors.is_empty() {
        return Err(ConfigError::ValidationFailed { errors });
    }

    Ok(Settings::from_raw(raw))
}
