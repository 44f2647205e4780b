//! Template coordinator
//!
//! Reacts to index lifecycle events from the cluster: a created index is
//! matched against the ISM templates of every stored policy and the winner
//! is attached; a deleted index stops being managed.

use chrono::{DateTime, Utc};
use ism_actions::IndexEvent;
use ism_config::{JobSchedule, ManagedIndexConfig, Policy};
use ism_store::{DocKind, DocumentStore, Store, StoreResult, Versioned, WriteCondition};
use ism_util::Result;
use std::cmp::Reverse;
use std::sync::Arc;
use tracing::{debug, info};

use crate::CoreEvent;

pub struct Coordinator {
    store: Arc<dyn Store>,
    schedule: JobSchedule,
    template_matching: bool,
}

impl Coordinator {
    pub fn new(store: Arc<dyn Store>, schedule: JobSchedule, template_matching: bool) -> Self {
        Self {
            store,
            schedule,
            template_matching,
        }
    }

    /// The policy whose template claims a new index.
    ///
    /// Highest template priority wins; equal priorities go to the
    /// lexicographically smallest policy id.
    pub fn find_matching_policy(
        &self,
        index: &str,
        creation_date: DateTime<Utc>,
    ) -> StoreResult<Option<Versioned<Policy>>> {
        let policies = self.store.list_policies()?;
        Ok(policies
            .into_iter()
            .filter_map(|p| {
                p.value
                    .template_priority_for(index, creation_date)
                    .map(|priority| (priority, p))
            })
            .max_by_key(|(priority, p)| (*priority, Reverse(p.value.policy_id.clone())))
            .map(|(_, p)| p))
    }

    pub fn handle_event(&self, event: &IndexEvent, now: DateTime<Utc>) -> Result<Option<CoreEvent>> {
        match event {
            IndexEvent::Created {
                index,
                uuid,
                creation_date,
            } => self.on_created(index, uuid, *creation_date, now),
            IndexEvent::Deleted { index, uuid } => self.on_deleted(index, uuid),
        }
    }

    fn on_created(
        &self,
        index: &str,
        uuid: &str,
        creation_date: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<CoreEvent>> {
        if !self.template_matching || index.starts_with('.') {
            return Ok(None);
        }
        if self.store.get_managed_config(index)?.is_some() {
            debug!(index = %index, "Created index is already managed");
            return Ok(None);
        }

        let Some(policy) = self.find_matching_policy(index, creation_date)? else {
            debug!(index = %index, "No template matches created index");
            return Ok(None);
        };

        let policy_id = policy.value.policy_id.clone();
        let config = ManagedIndexConfig::new(index, uuid, policy_id.clone(), self.schedule.clone(), now)
            .with_policy(policy.value, policy.version.seq_no, policy.version.primary_term);

        match self.store.put_managed_config(&config, WriteCondition::Create) {
            Ok(_) => {}
            // attached concurrently by another node or a user
            Err(e) if e.is_conflict() => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        info!(index = %index, policy_id = %policy_id, "Attached policy from template");
        Ok(Some(CoreEvent::PolicyAttached {
            index: index.to_string(),
            policy_id,
        }))
    }

    fn on_deleted(&self, index: &str, uuid: &str) -> Result<Option<CoreEvent>> {
        let Some(config) = self.store.get_managed_config(index)? else {
            return Ok(None);
        };
        if config.value.index_uuid != uuid {
            debug!(index = %index, uuid = %uuid, "Deleted index does not match managed uuid");
            return Ok(None);
        }

        remove_managed_index(self.store.as_ref(), index)?;
        info!(index = %index, "Index deleted, stopped managing it");
        Ok(Some(CoreEvent::PolicyRemoved {
            index: index.to_string(),
        }))
    }
}

/// Delete the config, metadata and lock of an index.
/// Returns whether a config existed.
pub(crate) fn remove_managed_index(store: &dyn Store, index: &str) -> StoreResult<bool> {
    let existed = store.delete_document(DocKind::ManagedConfig, index, None)?;
    store.delete_document(DocKind::Metadata, index, None)?;
    store.delete_document(DocKind::Lock, index, None)?;
    Ok(existed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use ism_config::parse_policy;
    use ism_store::SqliteStore;
    use ism_util::TimeValue;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap()
    }

    fn policy_with_template(id: &str, patterns: &str, priority: u32) -> Policy {
        let json = format!(
            r#"{{"default_state": "a", "states": [{{"name": "a"}}],
                "ism_template": {{"index_patterns": {}, "priority": {}}}}}"#,
            patterns, priority
        );
        parse_policy(id, &json, t0()).unwrap()
    }

    fn coordinator(policies: &[Policy]) -> (Arc<dyn Store>, Coordinator) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        for policy in policies {
            store.put_policy(policy, WriteCondition::Create).unwrap();
        }
        let schedule = JobSchedule::new(TimeValue::from_secs(300), 0.0);
        let coordinator = Coordinator::new(store.clone(), schedule, true);
        (store, coordinator)
    }

    fn created(index: &str, at: DateTime<Utc>) -> IndexEvent {
        IndexEvent::Created {
            index: index.into(),
            uuid: format!("{}-uuid", index),
            creation_date: at,
        }
    }

    #[test]
    fn highest_priority_wins() {
        let (_, coordinator) = coordinator(&[
            policy_with_template("broad", r#"["*"]"#, 1),
            policy_with_template("logs", r#"["logs-*"]"#, 100),
        ]);
        let later = t0() + Duration::hours(1);
        let winner = coordinator.find_matching_policy("logs-000001", later).unwrap().unwrap();
        assert_eq!(winner.value.policy_id.as_str(), "logs");
        let winner = coordinator.find_matching_policy("metrics", later).unwrap().unwrap();
        assert_eq!(winner.value.policy_id.as_str(), "broad");
    }

    #[test]
    fn equal_priority_prefers_smallest_policy_id() {
        let (_, coordinator) = coordinator(&[
            policy_with_template("zeta", r#"["logs-*"]"#, 10),
            policy_with_template("alpha", r#"["logs-*"]"#, 10),
        ]);
        let winner = coordinator
            .find_matching_policy("logs-1", t0() + Duration::hours(1))
            .unwrap()
            .unwrap();
        assert_eq!(winner.value.policy_id.as_str(), "alpha");
    }

    #[test]
    fn indices_older_than_template_are_ignored() {
        let (_, coordinator) = coordinator(&[policy_with_template("logs", r#"["logs-*"]"#, 1)]);
        let before = t0() - Duration::hours(1);
        assert!(coordinator.find_matching_policy("logs-1", before).unwrap().is_none());
    }

    #[test]
    fn created_event_attaches_once() {
        let (store, coordinator) = coordinator(&[policy_with_template("logs", r#"["logs-*"]"#, 1)]);
        let event = created("logs-1", t0() + Duration::hours(1));

        let attached = coordinator.handle_event(&event, t0()).unwrap();
        assert!(matches!(attached, Some(CoreEvent::PolicyAttached { .. })));
        let config = store.get_managed_config("logs-1").unwrap().unwrap().value;
        assert!(config.policy.is_some());
        assert_eq!(config.index_uuid, "logs-1-uuid");

        assert!(coordinator.handle_event(&event, t0()).unwrap().is_none());
    }

    #[test]
    fn hidden_indices_are_never_attached() {
        let (store, coordinator) = coordinator(&[policy_with_template("all", r#"["*"]"#, 1)]);
        let event = created(".internal", t0() + Duration::hours(1));
        assert!(coordinator.handle_event(&event, t0()).unwrap().is_none());
        assert!(store.get_managed_config(".internal").unwrap().is_none());
    }

    #[test]
    fn deleted_event_removes_managed_documents() {
        let (store, coordinator) = coordinator(&[policy_with_template("logs", r#"["logs-*"]"#, 1)]);
        coordinator
            .handle_event(&created("logs-1", t0() + Duration::hours(1)), t0())
            .unwrap();

        // a different incarnation of the same name is left alone
        let stale = IndexEvent::Deleted {
            index: "logs-1".into(),
            uuid: "other".into(),
        };
        assert!(coordinator.handle_event(&stale, t0()).unwrap().is_none());

        let deleted = IndexEvent::Deleted {
            index: "logs-1".into(),
            uuid: "logs-1-uuid".into(),
        };
        assert_eq!(
            coordinator.handle_event(&deleted, t0()).unwrap(),
            Some(CoreEvent::PolicyRemoved {
                index: "logs-1".into()
            })
        );
        assert!(store.get_managed_config("logs-1").unwrap().is_none());
    }
}
