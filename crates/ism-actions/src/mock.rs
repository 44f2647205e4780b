//! Mock cluster for testing

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ism_api::{IndexHealth, IndexState, IndexStats};
use ism_config::Script;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use crate::{
    ClusterClient, ClusterError, ClusterResult, IndexEvent, NodeInfo, SettingsUpdate,
    SnapshotState,
};

/// In-memory cluster for unit/integration testing
pub struct MockCluster {
    indices: Arc<Mutex<BTreeMap<String, IndexStats>>>,
    nodes: Arc<Mutex<Vec<NodeInfo>>>,
    snapshots: Arc<Mutex<HashMap<String, SnapshotState>>>,
    scripts: Arc<Mutex<HashMap<String, bool>>>,
    calls: Arc<Mutex<Vec<&'static str>>>,
    clock: Arc<Mutex<Option<DateTime<Utc>>>>,
    event_tx: Arc<Mutex<Option<mpsc::UnboundedSender<IndexEvent>>>>,

    /// Error returned by every operation
    fail_all: Arc<Mutex<Option<ClusterError>>>,

    /// Errors returned by single operations, keyed by operation name
    fail_ops: Arc<Mutex<HashMap<&'static str, ClusterError>>>,

    /// State new snapshots report
    snapshot_outcome: Arc<Mutex<SnapshotState>>,

    /// Called with the operation name on every call
    on_call: Arc<Mutex<Option<CallHook>>>,
}

type CallHook = Arc<dyn Fn(&'static str) + Send + Sync>;

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockCluster {
    pub fn new() -> Self {
        Self {
            indices: Arc::new(Mutex::new(BTreeMap::new())),
            nodes: Arc::new(Mutex::new(vec![NodeInfo {
                name: "node-1".into(),
                free_bytes: u64::MAX / 2,
            }])),
            snapshots: Arc::new(Mutex::new(HashMap::new())),
            scripts: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            clock: Arc::new(Mutex::new(None)),
            event_tx: Arc::new(Mutex::new(None)),
            fail_all: Arc::new(Mutex::new(None)),
            fail_ops: Arc::new(Mutex::new(HashMap::new())),
            snapshot_outcome: Arc::new(Mutex::new(SnapshotState::Success)),
            on_call: Arc::new(Mutex::new(None)),
        }
    }

    /// Add an index without emitting an event
    pub fn add_index(&self, stats: IndexStats) {
        guard(&self.indices).insert(stats.index.clone(), stats);
    }

    /// Simulate index creation; subscribers see an `IndexCreated` event
    pub fn create_index(&self, stats: IndexStats) {
        let event = IndexEvent::Created {
            index: stats.index.clone(),
            uuid: stats.uuid.clone(),
            creation_date: stats.creation_date,
        };
        self.add_index(stats);
        self.emit(event);
    }

    /// Simulate index deletion outside the engine
    pub fn remove_index(&self, index: &str) {
        if let Some(stats) = guard(&self.indices).remove(index) {
            self.emit(IndexEvent::Deleted {
                index: stats.index,
                uuid: stats.uuid,
            });
        }
    }

    pub fn update_index(&self, index: &str, f: impl FnOnce(&mut IndexStats)) {
        if let Some(stats) = guard(&self.indices).get_mut(index) {
            f(stats);
        }
    }

    pub fn index(&self, index: &str) -> Option<IndexStats> {
        guard(&self.indices).get(index).cloned()
    }

    pub fn has_index(&self, index: &str) -> bool {
        guard(&self.indices).contains_key(index)
    }

    /// Fix the clock used for creation and rollover dates
    pub fn set_time(&self, now: DateTime<Utc>) {
        *guard(&self.clock) = Some(now);
    }

    pub fn set_nodes(&self, nodes: Vec<NodeInfo>) {
        *guard(&self.nodes) = nodes;
    }

    pub fn set_script_outcome(&self, source: &str, outcome: bool) {
        guard(&self.scripts).insert(source.to_string(), outcome);
    }

    pub fn set_snapshot_outcome(&self, state: SnapshotState) {
        *guard(&self.snapshot_outcome) = state;
    }

    /// Make every operation fail (`None` to clear)
    pub fn fail_with(&self, error: Option<ClusterError>) {
        *guard(&self.fail_all) = error;
    }

    /// Make one operation fail (`None` to clear)
    pub fn fail_operation(&self, op: &'static str, error: Option<ClusterError>) {
        let mut ops = guard(&self.fail_ops);
        match error {
            Some(e) => ops.insert(op, e),
            None => ops.remove(op),
        };
    }

    /// Run `hook` with the operation name at the start of every call
    pub fn on_call(&self, hook: impl Fn(&'static str) + Send + Sync + 'static) {
        *guard(&self.on_call) = Some(Arc::new(hook));
    }

    /// Number of times an operation was called
    pub fn call_count(&self, op: &str) -> usize {
        guard(&self.calls).iter().filter(|c| **c == op).count()
    }

    fn now(&self) -> DateTime<Utc> {
        let clock = *guard(&self.clock);
        clock.unwrap_or_else(ism_util::now)
    }

    fn emit(&self, event: IndexEvent) {
        if let Some(tx) = guard(&self.event_tx).as_ref() {
            let _ = tx.send(event);
        }
    }

    fn enter(&self, op: &'static str) -> ClusterResult<()> {
        guard(&self.calls).push(op);
        let hook = guard(&self.on_call).clone();
        if let Some(hook) = hook {
            hook(op);
        }
        if let Some(e) = guard(&self.fail_all).clone() {
            return Err(e);
        }
        if let Some(e) = guard(&self.fail_ops).get(op).cloned() {
            return Err(e);
        }
        Ok(())
    }

    fn with_index<T>(&self, index: &str, f: impl FnOnce(&mut IndexStats) -> T) -> ClusterResult<T> {
        guard(&self.indices)
            .get_mut(index)
            .map(f)
            .ok_or_else(|| ClusterError::NotFound(format!("no such index [{}]", index)))
    }
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// `logs-000001` rolls over to `logs-000002`; names without a numeric
/// suffix get `-000002` appended
fn next_rollover_name(index: &str) -> String {
    match index.rsplit_once('-') {
        Some((prefix, digits)) if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) => {
            let next = digits.parse::<u64>().unwrap_or(0) + 1;
            format!("{}-{:0width$}", prefix, next, width = digits.len())
        }
        _ => format!("{}-000002", index),
    }
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn index_stats(&self, index: &str) -> ClusterResult<IndexStats> {
        self.enter("index_stats")?;
        self.with_index(index, |s| s.clone())
    }

    async fn list_indices(&self) -> ClusterResult<Vec<IndexStats>> {
        self.enter("list_indices")?;
        Ok(guard(&self.indices).values().cloned().collect())
    }

    async fn rollover(&self, alias: &str, _copy_alias: bool) -> ClusterResult<String> {
        self.enter("rollover")?;
        let now = self.now();

        let new_stats = {
            let mut indices = guard(&self.indices);
            let old = indices
                .values_mut()
                .find(|s| s.rollover_alias.as_deref() == Some(alias) && s.is_write_index)
                .ok_or_else(|| ClusterError::NotFound(format!("no write index for alias [{}]", alias)))?;

            old.is_write_index = false;
            old.rollover_date = Some(now);

            let name = next_rollover_name(&old.index);
            let mut new_stats = IndexStats::new(name.clone(), format!("{}-uuid", name), now);
            new_stats.rollover_alias = Some(alias.to_string());
            new_stats.is_write_index = true;
            new_stats.primary_shards = old.primary_shards;
            new_stats.replicas = old.replicas;
            indices.insert(name, new_stats.clone());
            new_stats
        };

        let name = new_stats.index.clone();
        self.emit(IndexEvent::Created {
            index: new_stats.index,
            uuid: new_stats.uuid,
            creation_date: new_stats.creation_date,
        });
        Ok(name)
    }

    async fn delete_index(&self, index: &str) -> ClusterResult<()> {
        self.enter("delete_index")?;
        let removed = guard(&self.indices).remove(index);
        match removed {
            Some(stats) => {
                self.emit(IndexEvent::Deleted {
                    index: stats.index,
                    uuid: stats.uuid,
                });
                Ok(())
            }
            None => Err(ClusterError::NotFound(format!("no such index [{}]", index))),
        }
    }

    async fn update_settings(&self, index: &str, update: &SettingsUpdate) -> ClusterResult<()> {
        self.enter("update_settings")?;
        self.with_index(index, |s| match update {
            SettingsUpdate::ReadOnly(read_only) => s.read_only = *read_only,
            SettingsUpdate::NumberOfReplicas(n) => s.replicas = *n,
            SettingsUpdate::Priority(p) => s.priority = Some(*p),
            SettingsUpdate::Allocation { .. } => {}
        })
    }

    async fn force_merge(&self, index: &str, max_num_segments: u32) -> ClusterResult<()> {
        self.enter("force_merge")?;
        self.with_index(index, |s| {
            s.max_segments_per_shard = s.max_segments_per_shard.min(max_num_segments);
        })
    }

    async fn list_nodes(&self) -> ClusterResult<Vec<NodeInfo>> {
        self.enter("list_nodes")?;
        Ok(guard(&self.nodes).clone())
    }

    async fn shards_relocated(&self, index: &str, _node: &str) -> ClusterResult<bool> {
        self.enter("shards_relocated")?;
        self.with_index(index, |_| true)
    }

    async fn shrink_index(&self, source: &str, target: &str, num_shards: u32) -> ClusterResult<()> {
        self.enter("shrink_index")?;
        let now = self.now();
        let mut indices = guard(&self.indices);
        if indices.contains_key(target) {
            return Err(ClusterError::Rejected(format!("index [{}] already exists", target)));
        }
        let source_stats = indices
            .get(source)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("no such index [{}]", source)))?;

        let mut stats = IndexStats::new(target, format!("{}-uuid", target), now);
        stats.primary_shards = num_shards;
        stats.doc_count = source_stats.doc_count;
        stats.size_bytes = source_stats.size_bytes;
        stats.health = IndexHealth::Green;
        indices.insert(target.to_string(), stats);
        Ok(())
    }

    async fn create_snapshot(&self, repository: &str, snapshot: &str, index: &str) -> ClusterResult<()> {
        self.enter("create_snapshot")?;
        self.with_index(index, |_| ())?;
        let state = guard(&self.snapshot_outcome).clone();
        guard(&self.snapshots).insert(format!("{}/{}", repository, snapshot), state);
        Ok(())
    }

    async fn snapshot_state(&self, repository: &str, snapshot: &str) -> ClusterResult<SnapshotState> {
        self.enter("snapshot_state")?;
        guard(&self.snapshots)
            .get(&format!("{}/{}", repository, snapshot))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("no such snapshot [{}]", snapshot)))
    }

    async fn open_index(&self, index: &str) -> ClusterResult<()> {
        self.enter("open_index")?;
        self.with_index(index, |s| s.state = IndexState::Open)
    }

    async fn close_index(&self, index: &str) -> ClusterResult<()> {
        self.enter("close_index")?;
        self.with_index(index, |s| s.state = IndexState::Close)
    }

    async fn evaluate_script(&self, index: &str, script: &Script) -> ClusterResult<bool> {
        self.enter("evaluate_script")?;
        self.with_index(index, |_| ())?;
        Ok(guard(&self.scripts).get(&script.source).copied().unwrap_or(false))
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<IndexEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *guard(&self.event_tx) = Some(tx);
        rx
    }
}
