//! ismd - The index state management service
//!
//! This is the main entry point for the ismd service.
//! It wires together all the components:
//! - Settings loading
//! - Store initialization
//! - Cluster adapter and index monitor
//! - Runner, coordinator and job scheduler

use anyhow::{Context, Result};
use clap::Parser;
use ism_actions::{ClusterClient, IndexEvent};
use ism_cluster::HttpCluster;
use ism_config::{JobSchedule, Settings, load_settings};
use ism_core::{
    AbortReason, Coordinator, CoreEvent, HistoryWriter, IndexManager, JobScheduler, LockService, Runner,
    TickOutcome,
};
use ism_store::{DocumentStore, SqliteStore, Store};
use ism_util::{IsmError, NodeId, STORE_FILENAME, TimeValue, default_settings_path};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// How long shutdown waits for in-flight ticks
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// ismd - Index state management for search clusters
#[derive(Parser, Debug)]
#[command(name = "ismd")]
#[command(about = "Index state management for search clusters", long_about = None)]
struct Args {
    /// Settings file path (default: ~/.config/ismd/ismd.toml)
    #[arg(short, long, env = "ISMD_CONFIG", default_value_os_t = default_settings_path())]
    config: PathBuf,

    /// Data directory override (or set ISMD_DATA_DIR env var)
    #[arg(short, long, env = "ISMD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Node id override (or set ISMD_NODE_ID env var)
    #[arg(short, long, env = "ISMD_NODE_ID")]
    node_id: Option<String>,

    /// Directory of policy JSON files stored at startup; the file stem is the policy id
    #[arg(short, long, env = "ISMD_POLICY_DIR")]
    policies: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

/// Main service state
struct Service {
    settings: Settings,
    store: Arc<dyn Store>,
    cluster: Arc<HttpCluster>,
    runner: Arc<Runner>,
    coordinator: Coordinator,
    scheduler: JobScheduler,
}

impl Service {
    async fn new(args: &Args) -> Result<Self> {
        let mut settings = if args.config.exists() {
            load_settings(&args.config)
                .with_context(|| format!("Failed to load settings from {:?}", args.config))?
        } else {
            info!(config_path = %args.config.display(), "No settings file, using defaults");
            Settings::default()
        };

        if let Some(data_dir) = &args.data_dir {
            settings.data_dir = data_dir.clone();
        }
        if let Some(node_id) = &args.node_id {
            settings.node_id = NodeId::new(node_id.clone());
        }

        info!(
            node_id = %settings.node_id,
            cluster_url = %settings.cluster.url,
            job_interval_secs = settings.jobs.interval.as_secs(),
            "Settings loaded"
        );

        std::fs::create_dir_all(&settings.data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", settings.data_dir))?;

        let db_path = settings.data_dir.join(STORE_FILENAME);
        let store: Arc<dyn Store> = Arc::new(
            SqliteStore::open(&db_path)
                .with_context(|| format!("Failed to open database {:?}", db_path))?,
        );
        info!(db_path = %db_path.display(), "Store initialized");

        let cluster = Arc::new(
            HttpCluster::new(&settings.cluster).context("Failed to create cluster client")?,
        );

        let schedule = JobSchedule::new(TimeValue::new(settings.jobs.interval), settings.jobs.jitter);

        if let Some(dir) = &args.policies {
            let manager = IndexManager::new(store.clone(), cluster.clone(), schedule.clone());
            let stored = store_policies(&manager, dir)
                .with_context(|| format!("Failed to load policies from {:?}", dir))?;
            info!(policy_dir = %dir.display(), stored, "Policies loaded");
        }

        let runner = Runner::new(
            store.clone(),
            cluster.clone(),
            LockService::new(store.clone(), settings.node_id.clone(), settings.jobs.lock_duration),
            HistoryWriter::new(store.clone(), settings.history_enabled),
        );
        let coordinator = Coordinator::new(store.clone(), schedule, settings.template_matching);

        Ok(Self {
            settings,
            store,
            cluster,
            runner: Arc::new(runner),
            coordinator,
            scheduler: JobScheduler::new(),
        })
    }

    async fn run(mut self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Start index monitor
        let monitor_handle = self
            .cluster
            .start_monitor(self.settings.cluster.monitor_interval, shutdown_rx);
        let mut index_events = self.cluster.subscribe();

        // Finished ticks report back here
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(String, TickOutcome)>();

        // Set up signal handlers
        let mut sigterm = signal(SignalKind::terminate())
            .context("Failed to create SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt())
            .context("Failed to create SIGINT handler")?;
        let mut sighup = signal(SignalKind::hangup())
            .context("Failed to create SIGHUP handler")?;

        let mut sweep_timer = tokio::time::interval(self.settings.jobs.sweep_interval);
        sweep_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!("Service running");

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, shutting down gracefully");
                    break;
                }

                // Sweep - start ticks for due indices
                _ = sweep_timer.tick() => {
                    self.sweep(&done_tx);
                }

                // Index created or deleted on the cluster
                Some(event) = index_events.recv() => {
                    self.handle_index_event(event);
                }

                // Tick finished
                Some((index, outcome)) = done_rx.recv() => {
                    self.handle_tick_finished(&index, &outcome);
                }
            }
        }

        info!("Shutting down ismd");
        let _ = shutdown_tx.send(true);

        // Let in-flight ticks release their leases
        let drain = async {
            while self.scheduler.in_flight() > 0 {
                match done_rx.recv().await {
                    Some((index, _)) => self.scheduler.finished(&index, ism_util::now()),
                    None => break,
                }
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            warn!(
                in_flight = self.scheduler.in_flight(),
                "Timed out waiting for in-flight ticks"
            );
        }

        if let Err(e) = monitor_handle.await {
            warn!(error = %e, "Index monitor task failed");
        }

        info!("Shutdown complete");
        Ok(())
    }

    fn sweep(&mut self, done_tx: &mpsc::UnboundedSender<(String, TickOutcome)>) {
        if !self.store.is_healthy() {
            warn!("Store unhealthy, skipping sweep");
            return;
        }

        let configs = match self.store.list_managed_configs() {
            Ok(configs) => configs,
            Err(e) => {
                warn!(error = %e, "Failed to list managed indices");
                return;
            }
        };

        let now = ism_util::now();
        let due = self.scheduler.sweep(configs.iter().map(|c| &c.value), now);
        if due.is_empty() {
            return;
        }
        debug!(due = due.len(), managed = configs.len(), "Starting ticks");

        for index in due {
            let runner = self.runner.clone();
            let done_tx = done_tx.clone();
            tokio::spawn(async move {
                // a panicking tick still reports back
                let tick_index = index.clone();
                let tick = tokio::spawn(async move { runner.run(&tick_index, now).await });
                let outcome = match tick.await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(index = %index, error = %e, "Tick task failed");
                        TickOutcome::Aborted(AbortReason::Panicked(e.to_string()))
                    }
                };
                let _ = done_tx.send((index, outcome));
            });
        }
    }

    fn handle_index_event(&mut self, event: IndexEvent) {
        match self.coordinator.handle_event(&event, ism_util::now()) {
            Ok(Some(CoreEvent::PolicyAttached { index, policy_id })) => {
                debug!(index = %index, policy_id = %policy_id, "Managed index will start on next sweep");
            }
            Ok(Some(CoreEvent::PolicyRemoved { index })) => {
                debug!(index = %index, "Managed index job dropped");
            }
            Ok(None) => {}
            Err(e) => {
                error!(event = ?event, error = %e, "Failed to handle index event");
            }
        }
    }

    fn handle_tick_finished(&mut self, index: &str, outcome: &TickOutcome) {
        self.scheduler.finished(index, ism_util::now());
        if let TickOutcome::Aborted(reason) = outcome {
            debug!(index = %index, reason = ?reason, "Tick aborted, retrying on schedule");
        }
    }
}

/// Store every `*.json` policy in `dir` that is not stored yet.
/// Returns how many were stored.
fn store_policies(manager: &IndexManager, dir: &Path) -> Result<usize> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let now = ism_util::now();
    let mut stored = 0;
    for path in paths {
        let Some(policy_id) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
            continue;
        };
        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read policy {:?}", path))?;

        match manager.put_policy(&policy_id, &json, None, now) {
            Ok(_) => stored += 1,
            Err(IsmError::VersionConflict(_)) => {
                debug!(policy_id = %policy_id, "Policy already stored, leaving it as is");
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Invalid policy {:?}", path));
            }
        }
    }
    Ok(stored)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        mock_time = ism_util::is_mock_time_active(),
        "ismd starting"
    );

    let service = Service::new(&args).await?;
    service.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use ism_actions::MockCluster;

    const POLICY: &str = r#"{"policy": {"default_state": "hot", "states": [{"name": "hot"}]}}"#;

    fn manager() -> (Arc<dyn Store>, IndexManager) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let schedule = JobSchedule::new(TimeValue::from_secs(300), 0.0);
        let manager = IndexManager::new(store.clone(), Arc::new(MockCluster::new()), schedule);
        (store, manager)
    }

    #[test]
    fn policy_directory_is_stored_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hot.json"), POLICY).unwrap();
        std::fs::write(dir.path().join("logs.json"), POLICY).unwrap();
        std::fs::write(dir.path().join("README.txt"), "not a policy").unwrap();

        let (store, manager) = manager();
        assert_eq!(store_policies(&manager, dir.path()).unwrap(), 2);
        assert_eq!(store.list_policies().unwrap().len(), 2);

        // restarts leave stored policies alone
        assert_eq!(store_policies(&manager, dir.path()).unwrap(), 0);
    }

    #[test]
    fn invalid_policy_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("bad.json"),
            r#"{"default_state": "missing", "states": [{"name": "hot"}]}"#,
        )
        .unwrap();

        let (_, manager) = manager();
        let err = store_policies(&manager, dir.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("bad.json"));
    }
}
