//! Integration tests for ismd
//!
//! These tests drive the runner, coordinator, scheduler and management
//! operations together against an in-memory store and a mock cluster.

use chrono::{DateTime, Duration, TimeZone, Utc};
use ism_actions::{ClusterClient, ClusterError, MockCluster};
use ism_api::{ChangePolicy, IndexStats, StepStatus};
use ism_config::JobSchedule;
use ism_core::{
    Coordinator, CoreEvent, HistoryWriter, IndexManager, JobScheduler, LockService, Runner,
    SkipReason, TickOutcome,
};
use ism_store::{DocumentStore, SqliteStore, Store, WriteCondition};
use ism_util::{NodeId, PolicyId, TimeValue};
use std::sync::Arc;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
}

const HOT_DELETE: &str = r#"{
    "policy": {
        "description": "roll over at 1gb, delete after a month",
        "default_state": "hot",
        "states": [
            {"name": "hot", "actions": [{"rollover": {"min_size": "1gb"}}],
             "transitions": [{"state_name": "delete", "conditions": {"min_index_age": "30d"}}]},
            {"name": "delete", "actions": [{"delete": {}}]}
        ],
        "ism_template": [{"index_patterns": ["logs-*"], "priority": 100}]
    }
}"#;

const READ_ONLY: &str = r#"{"default_state": "warm", "states": [
    {"name": "warm", "actions": [{"read_only": {},
        "retry": {"count": 2, "backoff": "constant", "delay": "1m"}}]}
]}"#;

struct Daemon {
    store: Arc<dyn Store>,
    cluster: Arc<MockCluster>,
    manager: IndexManager,
    runner: Runner,
}

fn schedule() -> JobSchedule {
    JobSchedule::new(TimeValue::from_secs(300), 0.0)
}

fn runner(store: &Arc<dyn Store>, cluster: &Arc<MockCluster>, node: &str) -> Runner {
    Runner::new(
        store.clone(),
        cluster.clone(),
        LockService::new(store.clone(), NodeId::new(node), std::time::Duration::from_secs(600)),
        HistoryWriter::new(store.clone(), true),
    )
}

fn daemon() -> Daemon {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
    let cluster = Arc::new(MockCluster::new());
    cluster.set_time(t0());
    let manager = IndexManager::new(store.clone(), cluster.clone(), schedule());
    let runner = runner(&store, &cluster, "node-a");
    Daemon {
        store,
        cluster,
        manager,
        runner,
    }
}

impl Daemon {
    async fn manage(&self, index: &str, policy_id: &str, json: &str) {
        self.manage_stats(IndexStats::new(index, format!("{}-uuid", index), t0()), policy_id, json)
            .await;
    }

    async fn manage_stats(&self, stats: IndexStats, policy_id: &str, json: &str) {
        let index = stats.index.clone();
        self.cluster.add_index(stats);
        self.manager.put_policy(policy_id, json, None, t0()).unwrap();
        let summary = self
            .manager
            .add_policy(&[index.as_str()], &PolicyId::new(policy_id), t0())
            .await
            .unwrap();
        assert_eq!(summary.updated_indices, 1);
    }

    /// Tick until the outcome is not a progression; returns the tick count
    async fn settle(&self, index: &str, now: DateTime<Utc>) -> usize {
        let mut ticks = 0;
        while self.runner.run(index, now).await.is_progressed() {
            ticks += 1;
            assert!(ticks < 20, "index never settled");
        }
        ticks
    }

    fn history_len(&self, index: &str) -> usize {
        self.store.recent_history(index, 1000).unwrap().len()
    }
}

#[tokio::test]
async fn test_hot_to_delete_after_thirty_days() {
    let d = daemon();
    let mut stats = IndexStats::new("logs-000001", "logs-uuid", t0());
    stats.rollover_alias = Some("logs".into());
    stats.is_write_index = true;
    d.manage_stats(stats, "hot-delete", HOT_DELETE).await;

    // below 1gb the rollover keeps polling
    d.settle("logs-000001", t0()).await;
    let meta = d.store.get_metadata("logs-000001").unwrap().unwrap().value;
    assert_eq!(meta.action.as_ref().unwrap().name, "rollover");
    assert_eq!(meta.step_status(), Some(StepStatus::Running));
    assert_eq!(d.cluster.call_count("rollover"), 0);

    d.cluster
        .update_index("logs-000001", |s| s.size_bytes = 2 * 1024 * 1024 * 1024);
    d.settle("logs-000001", t0() + Duration::hours(1)).await;
    assert_eq!(d.cluster.call_count("rollover"), 1);
    assert!(d.cluster.has_index("logs-000002"));
    let meta = d.store.get_metadata("logs-000001").unwrap().unwrap().value;
    assert!(meta.rolled_over);
    assert_eq!(meta.step_status(), Some(StepStatus::Completed));

    // too young: transitions are evaluated but nothing is written
    let before = d.store.get_metadata("logs-000001").unwrap().unwrap();
    let young = d.runner.run("logs-000001", t0() + Duration::days(29)).await;
    assert_eq!(young, TickOutcome::Unchanged);
    let after = d.store.get_metadata("logs-000001").unwrap().unwrap();
    assert_eq!(after.version, before.version);
    assert_eq!(after.value.state_name(), Some("hot"));
    assert!(after.value.transition_to.is_none());

    let later = t0() + Duration::days(31);
    d.settle("logs-000001", later).await;

    assert!(!d.cluster.has_index("logs-000001"));
    assert_eq!(d.cluster.call_count("delete_index"), 1);
    let meta = d.store.get_metadata("logs-000001").unwrap().unwrap().value;
    assert_eq!(meta.state_name(), Some("delete"));
    assert!(meta.policy_completed);

    let states: Vec<_> = d
        .store
        .recent_history("logs-000001", 100)
        .unwrap()
        .into_iter()
        .filter_map(|e| e.metadata.state_name().map(str::to_string))
        .collect();
    assert!(states.iter().any(|s| s == "hot"));
    assert!(states.iter().any(|s| s == "delete"));
}

#[tokio::test]
async fn test_retries_exhaust_then_manual_retry_recovers() {
    let d = daemon();
    d.manage("idx", "read-only", READ_ONLY).await;
    d.cluster
        .fail_operation("update_settings", Some(ClusterError::Rejected("blocked".into())));

    let mut now = t0();
    for _ in 0..20 {
        d.runner.run("idx", now).await;
        now += Duration::minutes(2);
    }

    // count = 2 means three attempts
    assert_eq!(d.cluster.call_count("update_settings"), 3);
    let meta = d.store.get_metadata("idx").unwrap().unwrap().value;
    assert!(meta.is_failed());
    assert!(meta.action.as_ref().unwrap().failed);

    // failed is terminal until someone intervenes
    assert_eq!(d.runner.run("idx", now).await, TickOutcome::Unchanged);

    d.cluster.fail_operation("update_settings", None);
    let summary = d.manager.retry_failed(&["idx"], None, now).unwrap();
    assert_eq!(summary.updated_indices, 1);

    d.settle("idx", now).await;
    let meta = d.store.get_metadata("idx").unwrap().unwrap().value;
    assert!(!meta.is_failed());
    assert!(meta.policy_completed);
    assert!(d.cluster.index("idx").unwrap().read_only);
}

#[tokio::test]
async fn test_terminal_index_is_idempotent() {
    let d = daemon();
    d.manage("idx", "read-only", READ_ONLY).await;
    d.settle("idx", t0()).await;

    let done = d.store.get_metadata("idx").unwrap().unwrap();
    assert!(done.value.policy_completed);
    let history = d.history_len("idx");

    for hours in 1..5 {
        let outcome = d.runner.run("idx", t0() + Duration::hours(hours)).await;
        assert_eq!(outcome, TickOutcome::Unchanged);
    }

    assert_eq!(d.store.get_metadata("idx").unwrap().unwrap().version, done.version);
    assert_eq!(d.history_len("idx"), history);
    assert!(d.store.get_lock("idx").unwrap().is_none());
}

#[tokio::test]
async fn test_change_policy_applies_after_running_action() {
    let d = daemon();
    d.manage("idx", "read-only", READ_ONLY).await;
    d.manager
        .put_policy(
            "archive",
            r#"{"default_state": "frozen", "states": [{"name": "frozen"}]}"#,
            None,
            t0(),
        )
        .unwrap();

    d.runner.run("idx", t0()).await; // init
    let started = d.runner.run("idx", t0()).await;
    assert_eq!(started.metadata().unwrap().step_status(), Some(StepStatus::Running));

    let summary = d
        .manager
        .change_policy(&["idx"], &ChangePolicy::new("archive"))
        .unwrap();
    assert_eq!(summary.updated_indices, 1);

    let explained = d.manager.explain("idx", false, t0()).await.unwrap();
    assert_eq!(
        explained.pending_change_policy.map(|c| c.policy_id),
        Some(PolicyId::new("archive"))
    );

    // the running step finishes under the old policy
    let finished = d.runner.run("idx", t0()).await;
    let meta = finished.metadata().unwrap();
    assert_eq!(meta.policy_id.as_str(), "read-only");
    assert_eq!(meta.step_status(), Some(StepStatus::Completed));

    let changed = d.runner.run("idx", t0()).await;
    let meta = changed.metadata().unwrap();
    assert_eq!(meta.policy_id.as_str(), "archive");
    assert_eq!(meta.state_name(), Some("frozen"));

    let explained = d.manager.explain("idx", false, t0()).await.unwrap();
    assert_eq!(explained.policy_id, Some(PolicyId::new("archive")));
    assert!(explained.pending_change_policy.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_executor_across_nodes() {
    let d = daemon();
    d.manage("idx", "read-only", READ_ONLY).await;

    let mut handles = Vec::new();
    for node in 0..8 {
        let runner = Arc::new(runner(&d.store, &d.cluster, &format!("node-{}", node)));
        handles.push(tokio::spawn(async move { runner.run("idx", t0()).await }));
    }
    for handle in handles {
        let outcome = handle.await.unwrap();
        assert!(!matches!(outcome, TickOutcome::Aborted(_)), "unexpected {:?}", outcome);
    }

    let initialized = d
        .store
        .recent_history("idx", 100)
        .unwrap()
        .into_iter()
        .filter(|e| {
            e.metadata
                .message()
                .is_some_and(|m| m.starts_with("Successfully initialized"))
        })
        .count();
    assert_eq!(initialized, 1);
    assert!(d.store.get_lock("idx").unwrap().is_none());

    // a live lease held elsewhere keeps every other node out
    let other = LockService::new(d.store.clone(), NodeId::new("node-x"), std::time::Duration::from_secs(600));
    let lease = other.acquire("idx", t0()).unwrap().unwrap();
    assert_eq!(
        d.runner.run("idx", t0()).await,
        TickOutcome::Skipped(SkipReason::LockHeld)
    );

    // an expired lease does not
    let expired = t0() + Duration::minutes(11);
    assert_ne!(
        d.runner.run("idx", expired).await,
        TickOutcome::Skipped(SkipReason::LockHeld)
    );
    other.release(&lease).unwrap();
}

#[tokio::test]
async fn test_metadata_versions_are_monotonic() {
    let d = daemon();
    d.manage("idx", "read-only", READ_ONLY).await;

    let mut seen = Vec::new();
    while d.runner.run("idx", t0()).await.is_progressed() {
        seen.push(d.store.get_metadata("idx").unwrap().unwrap().version.seq_no);
    }
    assert!(seen.len() >= 3);
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "versions {:?}", seen);

    // a writer holding an old version is rejected
    let current = d.store.get_metadata("idx").unwrap().unwrap();
    let mut stale = current.clone();
    stale.version.seq_no -= 1;
    let err = d
        .store
        .put_metadata(&current.value, WriteCondition::Match(stale.version))
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(d.store.get_metadata("idx").unwrap().unwrap().version, current.version);
}

#[tokio::test]
async fn test_created_index_is_attached_and_scheduled() {
    let d = daemon();
    d.manager.put_policy("hot-delete", HOT_DELETE, None, t0()).unwrap();
    let mut events = d.cluster.subscribe();
    let coordinator = Coordinator::new(d.store.clone(), schedule(), true);
    let mut scheduler = JobScheduler::with_seed(7);

    let later = t0() + Duration::hours(1);
    d.cluster.set_time(later);
    d.cluster
        .create_index(IndexStats::new("logs-000001", "logs-uuid", later));
    d.cluster
        .create_index(IndexStats::new("metrics-1", "metrics-uuid", later));

    let mut attached = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let Some(CoreEvent::PolicyAttached { index, .. }) = coordinator.handle_event(&event, later).unwrap() {
            attached.push(index);
        }
    }
    assert_eq!(attached, vec!["logs-000001".to_string()]);

    let configs = d.store.list_managed_configs().unwrap();
    let due = scheduler.sweep(configs.iter().map(|c| &c.value), later);
    assert_eq!(due, vec!["logs-000001".to_string()]);

    let outcome = d.runner.run("logs-000001", later).await;
    assert_eq!(outcome.metadata().unwrap().state_name(), Some("hot"));
    scheduler.finished("logs-000001", later);
    assert_eq!(
        scheduler.next_run("logs-000001"),
        Some(later + Duration::seconds(300))
    );

    // deleting the index stops managing it
    d.cluster.remove_index("logs-000001");
    let event = events.try_recv().unwrap();
    assert!(matches!(
        coordinator.handle_event(&event, later).unwrap(),
        Some(CoreEvent::PolicyRemoved { .. })
    ));
    assert_eq!(
        d.runner.run("logs-000001", later).await,
        TickOutcome::Skipped(SkipReason::NotManaged)
    );
}
