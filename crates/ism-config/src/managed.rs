//! Managed index config: the persisted binding of an index to a policy and a schedule

use chrono::{DateTime, Utc};
use ism_api::ChangePolicy;
use ism_util::{PolicyId, TimeValue, chrono_duration};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::policy::Policy;

/// Trigger schedule of one managed index job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSchedule {
    pub interval: TimeValue,

    /// Fraction of the interval that may be randomly shaved off each run,
    /// so that many indices attached together do not fire together
    #[serde(default)]
    pub jitter: f64,

    /// Explicit start of the schedule; runs are aligned to it when set
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
}

impl JobSchedule {
    pub fn new(interval: TimeValue, jitter: f64) -> Self {
        Self {
            interval,
            jitter,
            start_time: None,
        }
    }

    /// Next run instant after a run at `last` (or the first run when `None`)
    pub fn next_run_after<R: Rng + ?Sized>(
        &self,
        last: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> DateTime<Utc> {
        let interval = chrono_duration(self.interval.as_duration());

        let base = match (last, self.start_time) {
            (Some(last), _) => last.checked_add_signed(interval).unwrap_or(DateTime::<Utc>::MAX_UTC),
            (None, Some(start)) if start > now => start,
            (None, _) => now,
        };

        if self.jitter <= 0.0 || last.is_none() {
            return base;
        }

        let max_shave = interval.num_milliseconds() as f64 * self.jitter.min(1.0);
        let shave = rng.gen_range(0.0..=max_shave);
        base - chrono::Duration::milliseconds(shave as i64)
    }
}

/// Persisted job binding of one index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedIndexConfig {
    #[serde(default = "default_config_schema_version")]
    pub schema_version: u32,

    pub index: String,
    pub index_uuid: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub enabled_time: Option<DateTime<Utc>>,

    pub last_updated_time: DateTime<Utc>,

    pub schedule: JobSchedule,

    pub policy_id: PolicyId,

    /// Version of the policy document the snapshot below was taken from
    #[serde(default)]
    pub policy_seq_no: Option<i64>,

    #[serde(default)]
    pub policy_primary_term: Option<i64>,

    /// Snapshot of the policy taken when it was attached or last changed
    #[serde(default)]
    pub policy: Option<Policy>,

    /// Pending policy swap, applied by the runner at a safe boundary
    #[serde(default)]
    pub change_policy: Option<ChangePolicy>,
}

fn default_config_schema_version() -> u32 {
    ism_api::SCHEMA_VERSION
}

fn default_enabled() -> bool {
    true
}

impl ManagedIndexConfig {
    pub fn new(
        index: impl Into<String>,
        index_uuid: impl Into<String>,
        policy_id: PolicyId,
        schedule: JobSchedule,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            schema_version: ism_api::SCHEMA_VERSION,
            index: index.into(),
            index_uuid: index_uuid.into(),
            enabled: true,
            enabled_time: Some(now),
            last_updated_time: now,
            schedule,
            policy_id,
            policy_seq_no: None,
            policy_primary_term: None,
            policy: None,
            change_policy: None,
        }
    }

    /// Attach a policy snapshot read at the given document version
    pub fn with_policy(mut self, policy: Policy, seq_no: i64, primary_term: i64) -> Self {
        self.policy_id = policy.policy_id.clone();
        self.policy = Some(policy);
        self.policy_seq_no = Some(seq_no);
        self.policy_primary_term = Some(primary_term);
        self
    }

    /// Whether the snapshot was taken from the given policy document version
    pub fn snapshot_matches(&self, seq_no: i64, primary_term: i64) -> bool {
        self.policy.is_some()
            && self.policy_seq_no == Some(seq_no)
            && self.policy_primary_term == Some(primary_term)
    }
}
