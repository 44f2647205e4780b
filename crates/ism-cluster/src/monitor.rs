//! Index lifecycle monitoring
//!
//! The REST API has no change feed, so creations and deletions are
//! synthesized by polling the index catalogue and diffing it against the
//! previous poll.

use ism_actions::{ClusterClient, IndexEvent};
use ism_api::IndexStats;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::HttpCluster;

/// Fan-out of index events to every subscriber
#[derive(Clone, Default)]
pub struct EventSink {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<IndexEvent>>>>,
}

impl EventSink {
    fn lock(&self) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<IndexEvent>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<IndexEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber, dropping closed ones
    pub fn publish(&self, event: IndexEvent) {
        self.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }
}

/// Index names and uuids seen in the previous poll
#[derive(Debug, Default)]
pub struct IndexCatalogue {
    known: HashMap<String, String>,
}

impl IndexCatalogue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the catalogue with `current` and return what changed.
    ///
    /// An index recreated under the same name between polls shows up as a
    /// deletion of the old uuid followed by a creation of the new one.
    pub fn update(&mut self, current: &[IndexStats]) -> Vec<IndexEvent> {
        let mut events = Vec::new();
        let mut next = HashMap::with_capacity(current.len());

        for stats in current {
            match self.known.get(&stats.index) {
                Some(uuid) if *uuid == stats.uuid => {}
                previous => {
                    if let Some(uuid) = previous {
                        events.push(IndexEvent::Deleted {
                            index: stats.index.clone(),
                            uuid: uuid.clone(),
                        });
                    }
                    events.push(IndexEvent::Created {
                        index: stats.index.clone(),
                        uuid: stats.uuid.clone(),
                        creation_date: stats.creation_date,
                    });
                }
            }
            next.insert(stats.index.clone(), stats.uuid.clone());
        }

        let mut gone: Vec<_> = self
            .known
            .iter()
            .filter(|(index, _)| !next.contains_key(*index))
            .map(|(index, uuid)| IndexEvent::Deleted {
                index: index.clone(),
                uuid: uuid.clone(),
            })
            .collect();
        gone.sort_by(|a, b| event_index(a).cmp(event_index(b)));
        events.extend(gone);

        self.known = next;
        events
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}

fn event_index(event: &IndexEvent) -> &str {
    match event {
        IndexEvent::Created { index, .. } | IndexEvent::Deleted { index, .. } => index,
    }
}

impl HttpCluster {
    /// Start polling the index catalogue every `interval` until `shutdown`
    /// flips to true.
    ///
    /// The first poll reports every existing index as created, so indices
    /// that appeared while the daemon was down still get their template
    /// matched.
    pub fn start_monitor(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let cluster = self.clone();

        tokio::spawn(async move {
            let mut catalogue = IndexCatalogue::new();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            info!(interval_ms = interval.as_millis() as u64, "Index monitor started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        poll(&cluster, &mut catalogue).await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            debug!("Index monitor shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }
}

async fn poll(cluster: &HttpCluster, catalogue: &mut IndexCatalogue) {
    let current = match cluster.list_indices().await {
        Ok(current) => current,
        Err(e) => {
            // keep the previous catalogue so nothing is reported as deleted
            warn!(error = %e, "Failed to list indices");
            return;
        }
    };

    let events = catalogue.update(&current);
    if !events.is_empty() {
        debug!(count = events.len(), indices = catalogue.len(), "Index catalogue changed");
    }
    for event in events {
        cluster.events().publish(event);
    }
}
