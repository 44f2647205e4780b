//! Management operations
//!
//! The library surface an API layer calls to author policies and to attach,
//! detach, change, retry and explain managed indices. Operations touching
//! several indices report per-index failures in an [`UpdateSummary`]
//! instead of failing as a whole.

use chrono::{DateTime, Utc};
use ism_actions::{ClusterClient, ClusterError, Step, StepContext, StepError};
use ism_api::{
    ChangePolicy, ExplainIndex, FailedIndex, StepStatus, UpdateSummary, ValidationResult,
    info_message,
};
use ism_config::{JobSchedule, ManagedIndexConfig, Policy, parse_policy};
use ism_store::{DocKind, DocumentStore, Store, Version, Versioned, WriteCondition};
use ism_util::{IsmError, PolicyId, Result};
use std::sync::Arc;
use tracing::info;

use crate::coordinator::remove_managed_index;

pub struct IndexManager {
    store: Arc<dyn Store>,
    cluster: Arc<dyn ClusterClient>,
    schedule: JobSchedule,
}

impl IndexManager {
    pub fn new(store: Arc<dyn Store>, cluster: Arc<dyn ClusterClient>, schedule: JobSchedule) -> Self {
        Self {
            store,
            cluster,
            schedule,
        }
    }

    // Policies

    /// Create a policy, or update it when `expected` names its current version
    pub fn put_policy(
        &self,
        policy_id: &str,
        json: &str,
        expected: Option<Version>,
        now: DateTime<Utc>,
    ) -> Result<Versioned<Policy>> {
        let policy = parse_policy(policy_id, json, now)?;

        let condition = match expected {
            Some(version) => WriteCondition::Match(version),
            None => WriteCondition::Create,
        };
        let version = self.store.put_policy(&policy, condition)?;

        info!(policy_id = %policy.policy_id, seq_no = version.seq_no, "Policy stored");
        Ok(Versioned {
            value: policy,
            version,
        })
    }

    pub fn get_policy(&self, policy_id: &PolicyId) -> Result<Versioned<Policy>> {
        self.store
            .get_policy(policy_id)?
            .ok_or_else(|| IsmError::PolicyNotFound(policy_id.clone()))
    }

    /// Delete a policy. Indices already attached keep running their snapshot.
    pub fn delete_policy(&self, policy_id: &PolicyId) -> Result<()> {
        if !self
            .store
            .delete_document(DocKind::Policy, policy_id.as_str(), None)?
        {
            return Err(IsmError::PolicyNotFound(policy_id.clone()));
        }
        info!(policy_id = %policy_id, "Policy deleted");
        Ok(())
    }

    // Managed indices

    /// Attach a policy to indices that are not managed yet
    pub async fn add_policy(
        &self,
        indices: &[&str],
        policy_id: &PolicyId,
        now: DateTime<Utc>,
    ) -> Result<UpdateSummary> {
        let policy = self.get_policy(policy_id)?;
        let mut summary = UpdateSummary::default();

        for &index in indices {
            let stats = match self.cluster.index_stats(index).await {
                Ok(stats) => stats,
                Err(ClusterError::NotFound(_)) => {
                    failed(&mut summary, index, "This index does not exist");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let config =
                ManagedIndexConfig::new(index, stats.uuid, policy_id.clone(), self.schedule.clone(), now)
                    .with_policy(
                        policy.value.clone(),
                        policy.version.seq_no,
                        policy.version.primary_term,
                    );

            match self.store.put_managed_config(&config, WriteCondition::Create) {
                Ok(_) => {
                    info!(index = %index, policy_id = %policy_id, "Policy attached");
                    summary.updated_indices += 1;
                }
                Err(e) if e.is_conflict() => {
                    failed(&mut summary, index, "This index already has a policy, use the update policy API");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(summary)
    }

    /// Stop managing indices; their config, metadata and lock are deleted
    pub fn remove_policy(&self, indices: &[&str]) -> Result<UpdateSummary> {
        let mut summary = UpdateSummary::default();
        for &index in indices {
            if remove_managed_index(self.store.as_ref(), index)? {
                info!(index = %index, "Policy removed");
                summary.updated_indices += 1;
            } else {
                failed(&mut summary, index, "This index does not have a policy to remove");
            }
        }
        Ok(summary)
    }

    /// Record a pending policy change; the runner applies it at the next
    /// state boundary
    pub fn change_policy(&self, indices: &[&str], change: &ChangePolicy) -> Result<UpdateSummary> {
        let policy = self.get_policy(&change.policy_id)?;
        if let Some(state) = &change.state {
            if policy.value.state(state).is_none() {
                return Err(IsmError::validation(format!(
                    "State [state={}] does not exist in policy [policy_id={}]",
                    state, change.policy_id
                )));
            }
        }

        let mut summary = UpdateSummary::default();
        for &index in indices {
            let Some(mut config) = self.store.get_managed_config(index)? else {
                failed(&mut summary, index, "This index is not being managed");
                continue;
            };

            config.value.change_policy = Some(change.clone());
            match self
                .store
                .put_managed_config(&config.value, WriteCondition::Match(config.version))
            {
                Ok(_) => {
                    info!(index = %index, policy_id = %change.policy_id, "Change policy queued");
                    summary.updated_indices += 1;
                }
                Err(e) if e.is_conflict() => {
                    failed(&mut summary, index, "The managed index changed concurrently, try again");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(summary)
    }

    /// Clear the failed flags of failed indices so the runner resumes them,
    /// optionally from another state
    pub fn retry_failed(
        &self,
        indices: &[&str],
        state: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<UpdateSummary> {
        let mut summary = UpdateSummary::default();

        for &index in indices {
            let Some(config) = self.store.get_managed_config(index)? else {
                failed(&mut summary, index, "This index is not being managed");
                continue;
            };
            let Some(current) = self.store.get_metadata(index)? else {
                failed(&mut summary, index, "This index has not initialized yet");
                continue;
            };
            if !current.value.is_failed() {
                failed(&mut summary, index, "This index is not in failed state");
                continue;
            }

            let mut next = current.value.clone();
            next.policy_retry_info.failed = false;
            next.policy_completed = false;

            match state {
                Some(state) => {
                    let exists = config
                        .value
                        .policy
                        .as_ref()
                        .is_some_and(|p| p.state(state).is_some());
                    if !exists {
                        failed(&mut summary, index, &format!("Could not find state [state={}]", state));
                        continue;
                    }
                    next.state = Some(ism_api::StateMetaData {
                        name: state.to_string(),
                        start_time: now,
                    });
                    next.action = None;
                    next.step = None;
                    next.transition_to = None;
                }
                None => {
                    if let Some(action) = next.action.as_mut() {
                        action.failed = false;
                        action.consumed_retries = 0;
                        action.retry_after = None;
                    }
                    if let Some(step) = next.step.as_mut() {
                        step.status = StepStatus::Starting;
                    }
                }
            }
            next.info = info_message("Pending retry of failed managed index");

            match self
                .store
                .put_metadata(&next, WriteCondition::Match(current.version))
            {
                Ok(_) => {
                    info!(index = %index, state = ?next.state_name(), "Retrying failed index");
                    summary.updated_indices += 1;
                }
                Err(e) if e.is_conflict() => {
                    failed(&mut summary, index, "The managed index changed concurrently, try again");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(summary)
    }

    /// Read-only projection of an index's management state.
    ///
    /// With `validate`, the action the index is on (or about to start) is
    /// validated against the index as it is now.
    pub async fn explain(&self, index: &str, validate: bool, now: DateTime<Utc>) -> Result<ExplainIndex> {
        let Some(config) = self.store.get_managed_config(index)? else {
            return Ok(ExplainIndex::unmanaged(index));
        };
        let config = config.value;
        let metadata = self.store.get_metadata(index)?.map(|m| m.value);

        let validation = match (&metadata, validate) {
            (Some(metadata), true) => self.validate_current_action(&config, metadata, now).await?,
            _ => None,
        };

        Ok(ExplainIndex {
            index: config.index,
            index_uuid: Some(config.index_uuid),
            policy_id: Some(config.policy_id),
            enabled: config.enabled,
            metadata,
            pending_change_policy: config.change_policy,
            validation,
        })
    }

    async fn validate_current_action(
        &self,
        config: &ManagedIndexConfig,
        metadata: &ism_api::ManagedIndexMetaData,
        now: DateTime<Utc>,
    ) -> Result<Option<ValidationResult>> {
        let Some(state) = config
            .policy
            .as_ref()
            .and_then(|p| metadata.state_name().and_then(|name| p.state(name)))
        else {
            return Ok(None);
        };

        let step = match state.resolve_current_action(metadata) {
            Ok(ism_config::ActionResolution::Action { action, fresh, .. }) => {
                let step_name = match (&metadata.step, fresh) {
                    (Some(step), false) => step.name.as_str(),
                    _ => action.kind.first_step(),
                };
                Step::for_action(action, step_name)
            }
            Ok(_) => None,
            Err(e) => return Ok(Some(ValidationResult::failed(e.to_string()))),
        };
        let Some(step) = step else {
            return Ok(None);
        };

        let ctx = StepContext {
            index: &metadata.index,
            index_uuid: &metadata.index_uuid,
            cluster: self.cluster.as_ref(),
            metadata,
            now,
        };
        match step.validate(&ctx).await {
            Ok(result) => Ok(Some(result)),
            Err(StepError::Transient(e)) => Err(e.into()),
            Err(StepError::Validation(message)) => Ok(Some(ValidationResult::failed(message))),
        }
    }
}

fn failed(summary: &mut UpdateSummary, index: &str, reason: &str) {
    summary.failed_indices.push(FailedIndex {
        index: index.to_string(),
        reason: reason.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ism_actions::MockCluster;
    use ism_api::{IndexStats, ManagedIndexMetaData, StateMetaData, ValidationStatus};
    use ism_store::SqliteStore;
    use ism_util::TimeValue;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap()
    }

    const POLICY: &str = r#"{"policy": {"default_state": "hot", "states": [
        {"name": "hot", "actions": [{"delete": {}}], "transitions": []},
        {"name": "cold"}
    ]}}"#;

    fn manager() -> (Arc<dyn Store>, Arc<MockCluster>, IndexManager) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let cluster = Arc::new(MockCluster::new());
        let manager = IndexManager::new(
            store.clone(),
            cluster.clone(),
            JobSchedule::new(TimeValue::from_secs(300), 0.0),
        );
        (store, cluster, manager)
    }

    #[test]
    fn put_policy_creates_then_requires_version() {
        let (_, _, manager) = manager();
        let created = manager.put_policy("p", POLICY, None, t0()).unwrap();

        assert!(matches!(
            manager.put_policy("p", POLICY, None, t0()),
            Err(IsmError::VersionConflict(_))
        ));

        let updated = manager
            .put_policy("p", POLICY, Some(created.version), t0())
            .unwrap();
        assert!(updated.version > created.version);

        assert!(matches!(
            manager.put_policy("p", POLICY, Some(created.version), t0()),
            Err(IsmError::VersionConflict(_))
        ));
    }

    #[test]
    fn invalid_policy_is_rejected() {
        let (_, _, manager) = manager();
        let json = r#"{"default_state": "missing", "states": [{"name": "hot"}]}"#;
        assert!(matches!(
            manager.put_policy("p", json, None, t0()),
            Err(IsmError::ValidationError(_))
        ));
    }

    #[test]
    fn delete_missing_policy_is_not_found() {
        let (_, _, manager) = manager();
        let id = PolicyId::from("nope");
        assert!(matches!(manager.delete_policy(&id), Err(IsmError::PolicyNotFound(_))));
        assert!(matches!(manager.get_policy(&id), Err(IsmError::PolicyNotFound(_))));
    }

    #[tokio::test]
    async fn add_policy_reports_per_index_failures() {
        let (store, cluster, manager) = manager();
        cluster.add_index(IndexStats::new("a", "a-uuid", t0()));
        manager.put_policy("p", POLICY, None, t0()).unwrap();
        let id = PolicyId::from("p");

        let summary = manager.add_policy(&["a", "missing"], &id, t0()).await.unwrap();
        assert_eq!(summary.updated_indices, 1);
        assert_eq!(summary.failed_indices.len(), 1);
        assert_eq!(summary.failed_indices[0].index, "missing");

        let config = store.get_managed_config("a").unwrap().unwrap().value;
        assert_eq!(config.index_uuid, "a-uuid");
        assert!(config.policy.is_some());

        let again = manager.add_policy(&["a"], &id, t0()).await.unwrap();
        assert_eq!(again.updated_indices, 0);
        assert!(again.failed_indices[0].reason.contains("already has a policy"));
    }

    #[tokio::test]
    async fn remove_policy_deletes_everything() {
        let (store, cluster, manager) = manager();
        cluster.add_index(IndexStats::new("a", "a-uuid", t0()));
        manager.put_policy("p", POLICY, None, t0()).unwrap();
        manager.add_policy(&["a"], &"p".into(), t0()).await.unwrap();
        store
            .put_metadata(
                &ManagedIndexMetaData::new("a", "a-uuid", "p".into()),
                WriteCondition::Create,
            )
            .unwrap();

        let summary = manager.remove_policy(&["a", "b"]).unwrap();
        assert_eq!(summary.updated_indices, 1);
        assert_eq!(summary.failed_indices[0].index, "b");
        assert!(store.get_managed_config("a").unwrap().is_none());
        assert!(store.get_metadata("a").unwrap().is_none());
    }

    #[tokio::test]
    async fn change_policy_is_queued_on_config() {
        let (store, cluster, manager) = manager();
        cluster.add_index(IndexStats::new("a", "a-uuid", t0()));
        manager.put_policy("p", POLICY, None, t0()).unwrap();
        manager.add_policy(&["a"], &"p".into(), t0()).await.unwrap();

        let bad = ChangePolicy::new("p").with_state("nowhere");
        assert!(matches!(
            manager.change_policy(&["a"], &bad),
            Err(IsmError::ValidationError(_))
        ));

        let change = ChangePolicy::new("p").with_state("cold");
        let summary = manager.change_policy(&["a", "b"], &change).unwrap();
        assert_eq!(summary.updated_indices, 1);
        let config = store.get_managed_config("a").unwrap().unwrap().value;
        assert_eq!(config.change_policy, Some(change));
    }

    #[tokio::test]
    async fn retry_failed_clears_flags() {
        let (store, cluster, manager) = manager();
        cluster.add_index(IndexStats::new("a", "a-uuid", t0()));
        manager.put_policy("p", POLICY, None, t0()).unwrap();
        manager.add_policy(&["a"], &"p".into(), t0()).await.unwrap();

        let mut meta = ManagedIndexMetaData::new("a", "a-uuid", "p".into());
        meta.state = Some(StateMetaData {
            name: "hot".into(),
            start_time: t0(),
        });
        let mut action = ism_api::ActionMetaData::new("delete", 0, t0());
        action.failed = true;
        action.consumed_retries = 3;
        meta.action = Some(action);
        meta.step = Some(ism_api::StepMetaData::new("attempt_delete", t0(), StepStatus::Failed));
        meta.policy_retry_info.failed = true;
        store.put_metadata(&meta, WriteCondition::Create).unwrap();

        let summary = manager.retry_failed(&["a"], None, t0()).unwrap();
        assert_eq!(summary.updated_indices, 1);

        let meta = store.get_metadata("a").unwrap().unwrap().value;
        assert!(!meta.is_failed());
        let action = meta.action.unwrap();
        assert!(!action.failed);
        assert_eq!(action.consumed_retries, 0);
        assert_eq!(meta.step.unwrap().status, StepStatus::Starting);

        let again = manager.retry_failed(&["a"], None, t0()).unwrap();
        assert!(again.failed_indices[0].reason.contains("not in failed state"));
    }

    #[tokio::test]
    async fn retry_failed_into_other_state() {
        let (store, cluster, manager) = manager();
        cluster.add_index(IndexStats::new("a", "a-uuid", t0()));
        manager.put_policy("p", POLICY, None, t0()).unwrap();
        manager.add_policy(&["a"], &"p".into(), t0()).await.unwrap();

        let mut meta = ManagedIndexMetaData::new("a", "a-uuid", "p".into());
        meta.policy_retry_info.failed = true;
        store.put_metadata(&meta, WriteCondition::Create).unwrap();

        let missing = manager.retry_failed(&["a"], Some("nowhere"), t0()).unwrap();
        assert_eq!(missing.failed_indices.len(), 1);

        manager.retry_failed(&["a"], Some("cold"), t0()).unwrap();
        let meta = store.get_metadata("a").unwrap().unwrap().value;
        assert_eq!(meta.state_name(), Some("cold"));
        assert!(meta.action.is_none());
    }

    #[tokio::test]
    async fn explain_projects_metadata_and_validation() {
        let (store, cluster, manager) = manager();
        let mut stats = IndexStats::new("a", "a-uuid", t0());
        stats.rollover_alias = Some("alias".into());
        stats.is_write_index = true;
        cluster.add_index(stats);
        manager.put_policy("p", POLICY, None, t0()).unwrap();
        manager.add_policy(&["a"], &"p".into(), t0()).await.unwrap();

        let unmanaged = manager.explain("other", false, t0()).await.unwrap();
        assert!(unmanaged.policy_id.is_none());

        let mut meta = ManagedIndexMetaData::new("a", "a-uuid", "p".into());
        meta.state = Some(StateMetaData {
            name: "hot".into(),
            start_time: t0(),
        });
        store.put_metadata(&meta, WriteCondition::Create).unwrap();

        let explained = manager.explain("a", true, t0()).await.unwrap();
        assert_eq!(explained.policy_id, Some(PolicyId::from("p")));
        assert_eq!(explained.metadata.unwrap().state_name(), Some("hot"));
        // the pending delete targets the alias write index
        assert_eq!(explained.validation.unwrap().status, ValidationStatus::Failed);
    }
}
