//! Validated daemon settings

use ism_util::{NodeId, default_data_dir};
use std::path::PathBuf;
use std::time::Duration;

use crate::schema::RawSettings;

pub const DEFAULT_CLUSTER_URL: &str = "http://localhost:9200";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_JOB_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_JOB_JITTER: f64 = 0.6;
pub const DEFAULT_LOCK_DURATION_SECS: u64 = 1800;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5;

/// Upper bounds accepted by settings validation
pub const MAX_JOB_INTERVAL_SECS: u64 = 7 * 86_400;
pub const MAX_LOCK_DURATION_SECS: u64 = 86_400;

/// Daemon settings with defaults applied
#[derive(Debug, Clone)]
pub struct Settings {
    pub node_id: NodeId,
    pub data_dir: PathBuf,
    pub cluster: ClusterSettings,
    pub jobs: JobSettings,
    pub template_matching: bool,
    pub history_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct ClusterSettings {
    pub url: String,
    pub request_timeout: Duration,
    pub monitor_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct JobSettings {
    pub interval: Duration,
    pub jitter: f64,
    pub lock_duration: Duration,
    pub sweep_interval: Duration,
}

impl Settings {
    /// Convert from raw settings (after validation)
    pub fn from_raw(raw: RawSettings) -> Self {
        Self {
            node_id: raw.node.node_id.map(NodeId::new).unwrap_or_else(NodeId::random),
            data_dir: raw.paths.data_dir.unwrap_or_else(default_data_dir),
            cluster: ClusterSettings {
                url: raw
                    .cluster
                    .url
                    .unwrap_or_else(|| DEFAULT_CLUSTER_URL.to_string()),
                request_timeout: Duration::from_secs(
                    raw.cluster
                        .request_timeout_seconds
                        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
                ),
                monitor_interval: Duration::from_secs(
                    raw.cluster
                        .monitor_interval_seconds
                        .unwrap_or(DEFAULT_MONITOR_INTERVAL_SECS),
                ),
            },
            jobs: JobSettings {
                interval: Duration::from_secs(
                    raw.jobs.interval_seconds.unwrap_or(DEFAULT_JOB_INTERVAL_SECS),
                ),
                jitter: raw.jobs.jitter.unwrap_or(DEFAULT_JOB_JITTER),
                lock_duration: Duration::from_secs(
                    raw.jobs
                        .lock_duration_seconds
                        .unwrap_or(DEFAULT_LOCK_DURATION_SECS),
                ),
                sweep_interval: Duration::from_secs(
                    raw.jobs
                        .sweep_interval_seconds
                        .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
                ),
            },
            template_matching: raw.coordinator.template_matching.unwrap_or(true),
            history_enabled: raw.history.enabled.unwrap_or(true),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_raw(RawSettings {
            config_version: crate::CURRENT_CONFIG_VERSION,
            node: Default::default(),
            paths: Default::default(),
            cluster: Default::default(),
            jobs: Default::default(),
            coordinator: Default::default(),
            history: Default::default(),
        })
    }
}
