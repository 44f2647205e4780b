//! Action vocabulary: the fixed set of lifecycle operations a state may run

use ism_util::{ByteSize, TimeValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Parameters of actions that take none
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoParams {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RolloverParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_size: Option<ByteSize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_doc_count: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_index_age: Option<TimeValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_primary_shard_size: Option<ByteSize>,

    /// Copy the non-rollover aliases of the old index to the new one
    #[serde(default)]
    pub copy_alias: bool,
}

impl RolloverParams {
    pub fn has_conditions(&self) -> bool {
        self.min_size.is_some()
            || self.min_doc_count.is_some()
            || self.min_index_age.is_some()
            || self.min_primary_shard_size.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForceMergeParams {
    pub max_num_segments: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShrinkParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_new_shards: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_shard_size: Option<ByteSize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage_of_source_shards: Option<f64>,

    /// Name of the shrunken index; `{index}` is replaced with the source name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_index_name_template: Option<String>,

    /// Shrink even when the index has no replicas
    #[serde(default)]
    pub force_unsafe: bool,
}

/// Default template used to name the shrunken index
pub const DEFAULT_SHRINK_TARGET_TEMPLATE: &str = "{index}_shrunken";

impl ShrinkParams {
    pub fn target_index_name(&self, source: &str) -> String {
        self.target_index_name_template
            .as_deref()
            .unwrap_or(DEFAULT_SHRINK_TARGET_TEMPLATE)
            .replace("{index}", source)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotParams {
    pub repository: String,

    /// Snapshot name prefix; a timestamp suffix is appended
    pub snapshot: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaCountParams {
    pub number_of_replicas: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexPriorityParams {
    pub priority: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocationParams {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub require: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub include: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exclude: BTreeMap<String, String>,
}

/// Type tag plus type-specific parameters of an action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Rollover(RolloverParams),
    Delete(NoParams),
    ForceMerge(ForceMergeParams),
    Shrink(ShrinkParams),
    Snapshot(SnapshotParams),
    ReplicaCount(ReplicaCountParams),
    ReadOnly(NoParams),
    ReadWrite(NoParams),
    IndexPriority(IndexPriorityParams),
    Open(NoParams),
    Close(NoParams),
    Allocation(AllocationParams),
}

impl ActionKind {
    /// Name of the action as written in policies and recorded in metadata
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::Rollover(_) => "rollover",
            ActionKind::Delete(_) => "delete",
            ActionKind::ForceMerge(_) => "force_merge",
            ActionKind::Shrink(_) => "shrink",
            ActionKind::Snapshot(_) => "snapshot",
            ActionKind::ReplicaCount(_) => "replica_count",
            ActionKind::ReadOnly(_) => "read_only",
            ActionKind::ReadWrite(_) => "read_write",
            ActionKind::IndexPriority(_) => "index_priority",
            ActionKind::Open(_) => "open",
            ActionKind::Close(_) => "close",
            ActionKind::Allocation(_) => "allocation",
        }
    }

    /// Ordered step names backing this action
    pub fn step_names(&self) -> &'static [&'static str] {
        match self {
            ActionKind::Rollover(_) => &["attempt_rollover"],
            ActionKind::Delete(_) => &["attempt_delete"],
            ActionKind::ForceMerge(_) => &[
                "attempt_set_read_only",
                "attempt_call_force_merge",
                "wait_for_force_merge",
            ],
            ActionKind::Shrink(_) => &[
                "attempt_move_shards",
                "wait_for_move_shards",
                "attempt_shrink",
                "wait_for_shrink",
            ],
            ActionKind::Snapshot(_) => &["attempt_snapshot", "wait_for_snapshot"],
            ActionKind::ReplicaCount(_) => &["attempt_set_replica_count"],
            ActionKind::ReadOnly(_) => &["set_read_only"],
            ActionKind::ReadWrite(_) => &["set_read_write"],
            ActionKind::IndexPriority(_) => &["attempt_set_index_priority"],
            ActionKind::Open(_) => &["attempt_open"],
            ActionKind::Close(_) => &["attempt_close"],
            ActionKind::Allocation(_) => &["attempt_allocation"],
        }
    }

    pub fn first_step(&self) -> &'static str {
        self.step_names()[0]
    }

    /// The step following `step`, if any
    pub fn next_step(&self, step: &str) -> Option<&'static str> {
        let steps = self.step_names();
        let pos = steps.iter().position(|s| *s == step)?;
        steps.get(pos + 1).copied()
    }

    pub fn is_last_step(&self, step: &str) -> bool {
        self.step_names().last().is_some_and(|s| *s == step)
    }
}

/// How the delay between retries grows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Constant,
    Linear,
    #[default]
    Exponential,
}

/// Retry policy of an action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRetry {
    #[serde(default = "default_retry_count")]
    pub count: u32,

    #[serde(default)]
    pub backoff: Backoff,

    #[serde(default = "default_retry_delay")]
    pub delay: TimeValue,
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_delay() -> TimeValue {
    TimeValue::from_secs(60)
}

impl Default for ActionRetry {
    fn default() -> Self {
        Self {
            count: default_retry_count(),
            backoff: Backoff::default(),
            delay: default_retry_delay(),
        }
    }
}

impl ActionRetry {
    pub fn none() -> Self {
        Self {
            count: 0,
            ..Self::default()
        }
    }

    /// Delay before the retry that follows `consumed` earlier retries
    pub fn backoff_delay(&self, consumed: u32) -> Duration {
        let delay = self.delay.as_duration();
        match self.backoff {
            Backoff::Constant => delay,
            Backoff::Linear => delay.saturating_mul(consumed.saturating_add(1)),
            Backoff::Exponential => {
                let factor = 2u32.checked_pow(consumed).unwrap_or(u32::MAX);
                delay.saturating_mul(factor)
            }
        }
    }

    pub fn has_budget(&self, consumed: u32) -> bool {
        consumed < self.count
    }
}

/// One action of a state: kind, retry policy and optional timeout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionConfig {
    #[serde(flatten)]
    pub kind: ActionKind,

    #[serde(default)]
    pub retry: ActionRetry,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeValue>,
}

impl ActionConfig {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            retry: ActionRetry::default(),
            timeout: None,
        }
    }

    pub fn with_retry(mut self, retry: ActionRetry) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: TimeValue) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}
