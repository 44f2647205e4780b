//! Error types for ismd management operations

use thiserror::Error;

use crate::PolicyId;

/// Error type for management operations (attach, detach, change policy, explain)
#[derive(Debug, Error)]
pub enum IsmError {
    #[error("Policy not found: {0}")]
    PolicyNotFound(PolicyId),

    #[error("Index not managed: {0}")]
    IndexNotManaged(String),

    #[error("Index already managed: {0}")]
    IndexAlreadyManaged(String),

    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Version conflict: {0}")]
    VersionConflict(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Cluster error: {0}")]
    ClusterError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IsmError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::VersionConflict(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::StoreError(msg.into())
    }

    pub fn cluster(msg: impl Into<String>) -> Self {
        Self::ClusterError(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, IsmError>;
