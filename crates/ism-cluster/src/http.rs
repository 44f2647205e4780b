//! REST implementation of the cluster client

use async_trait::async_trait;
use ism_actions::{
    ClusterClient, ClusterError, ClusterResult, IndexEvent, NodeInfo, SettingsUpdate,
    SnapshotState,
};
use ism_api::IndexStats;
use ism_config::{ClusterSettings, Script};
use reqwest::{Client, Method, RequestBuilder};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::EventSink;
use crate::convert::*;

/// Cluster client over the search cluster REST API
#[derive(Clone)]
pub struct HttpCluster {
    client: Client,
    base_url: String,
    events: EventSink,
    healthy: Arc<AtomicBool>,
}

impl HttpCluster {
    pub fn new(settings: &ClusterSettings) -> ClusterResult<Self> {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .connect_timeout(settings.request_timeout)
            .build()
            .map_err(|e| ClusterError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        info!(url = %settings.url, "Cluster client created");
        Ok(Self {
            client,
            base_url: settings.url.trim_end_matches('/').to_string(),
            events: EventSink::default(),
            healthy: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, format!("{}/{}", self.base_url, path))
    }

    /// Send a request and decode its JSON body; empty bodies decode to null
    async fn send(&self, request: RequestBuilder) -> ClusterResult<Value> {
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let error = request_error(&e);
                if error.is_transient() && self.healthy.swap(false, Ordering::Relaxed) {
                    warn!(error = %e, "Cluster became unreachable");
                }
                return Err(error);
            }
        };

        if !self.healthy.swap(true, Ordering::Relaxed) {
            info!("Cluster reachable again");
        }

        let status = response.status();
        let body = response.bytes().await.map_err(|e| request_error(&e))?;
        if !status.is_success() {
            let text = String::from_utf8_lossy(&body);
            debug!(status = %status, body = %text, "Cluster request failed");
            return Err(status_error(status, &text));
        }

        if body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&body)
            .map_err(|e| ClusterError::Internal(format!("Malformed response: {}", e)))
    }

    async fn get(&self, path: &str) -> ClusterResult<Value> {
        self.send(self.request(Method::GET, path)).await
    }

    async fn post(&self, path: &str, body: &Value) -> ClusterResult<Value> {
        self.send(self.request(Method::POST, path).json(body)).await
    }

    async fn post_empty(&self, path: &str) -> ClusterResult<Value> {
        self.send(self.request(Method::POST, path)).await
    }

    async fn put(&self, path: &str, body: &Value) -> ClusterResult<Value> {
        self.send(self.request(Method::PUT, path).json(body)).await
    }

    async fn cat_index(&self, index: &str) -> ClusterResult<IndexStats> {
        let body = self
            .get(&format!(
                "_cat/indices/{}?format=json&bytes=b&h={}",
                index, CAT_INDICES_COLUMNS
            ))
            .await?;
        parse_cat_indices(&body)?
            .into_iter()
            .find(|s| s.index == index)
            .ok_or_else(|| ClusterError::NotFound(index.to_string()))
    }

    /// Add the aliases of `old_index` other than `alias` to `new_index`
    async fn copy_aliases(&self, alias: &str, old_index: &str, new_index: &str) -> ClusterResult<()> {
        let body = self.get(&format!("{}/_alias", old_index)).await?;
        let aliases = aliases_except(&body, old_index, alias);
        if aliases.is_empty() {
            return Ok(());
        }

        let actions: Vec<Value> = aliases
            .iter()
            .map(|a| json!({ "add": { "index": new_index, "alias": a } }))
            .collect();
        self.post("_aliases", &json!({ "actions": actions })).await?;
        debug!(index = %new_index, aliases = ?aliases, "Copied aliases to rolled over index");
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for HttpCluster {
    async fn index_stats(&self, index: &str) -> ClusterResult<IndexStats> {
        let mut stats = self.cat_index(index).await?;

        let settings = self.get(&format!("{}?flat_settings=true", index)).await?;
        apply_index_settings(&mut stats, &settings);

        let shards = self
            .get(&format!("{}/_stats/store,segments?level=shards", index))
            .await?;
        apply_shard_stats(&mut stats, &shards);

        if let Some(alias) = stats.rollover_alias.clone() {
            let state = self
                .get(&format!("_cluster/state/metadata/{}", index))
                .await?;
            stats.rollover_date = parse_rollover_date(&state, index, &alias);
        }

        Ok(stats)
    }

    async fn list_indices(&self) -> ClusterResult<Vec<IndexStats>> {
        let body = self
            .get(&format!(
                "_cat/indices?format=json&bytes=b&expand_wildcards=all&h={}",
                CAT_INDICES_COLUMNS
            ))
            .await?;
        parse_cat_indices(&body)
    }

    async fn rollover(&self, alias: &str, copy_alias: bool) -> ClusterResult<String> {
        let body = self.post(&format!("{}/_rollover", alias), &json!({})).await?;
        let new_index = parse_rollover(&body)?;

        if copy_alias {
            if let Some(old_index) = body.get("old_index").and_then(Value::as_str) {
                self.copy_aliases(alias, old_index, &new_index).await?;
            }
        }

        info!(alias = %alias, new_index = %new_index, "Rolled over");
        Ok(new_index)
    }

    async fn delete_index(&self, index: &str) -> ClusterResult<()> {
        self.send(self.request(Method::DELETE, index)).await?;
        info!(index = %index, "Deleted index");
        Ok(())
    }

    async fn update_settings(&self, index: &str, update: &SettingsUpdate) -> ClusterResult<()> {
        self.put(&format!("{}/_settings", index), &settings_body(update))
            .await?;
        debug!(index = %index, update = ?update, "Updated index settings");
        Ok(())
    }

    async fn force_merge(&self, index: &str, max_num_segments: u32) -> ClusterResult<()> {
        let path = format!(
            "{}/_forcemerge?max_num_segments={}&wait_for_completion=false",
            index, max_num_segments
        );
        self.post_empty(&path).await?;
        Ok(())
    }

    async fn list_nodes(&self) -> ClusterResult<Vec<NodeInfo>> {
        let body = self.get("_nodes/stats/fs").await?;
        parse_nodes(&body)
    }

    async fn shards_relocated(&self, index: &str, node: &str) -> ClusterResult<bool> {
        let body = self
            .get(&format!("_cat/shards/{}?format=json&h=shard,prirep,state,node", index))
            .await?;
        shards_on_node(&body, node)
    }

    async fn shrink_index(&self, source: &str, target: &str, num_shards: u32) -> ClusterResult<()> {
        self.post(&format!("{}/_shrink/{}", source, target), &shrink_body(num_shards))
            .await?;
        info!(source = %source, target = %target, num_shards, "Started shrink");
        Ok(())
    }

    async fn create_snapshot(&self, repository: &str, snapshot: &str, index: &str) -> ClusterResult<()> {
        let body = json!({ "indices": index, "include_global_state": false });
        self.put(
            &format!("_snapshot/{}/{}?wait_for_completion=false", repository, snapshot),
            &body,
        )
        .await?;
        info!(index = %index, repository = %repository, snapshot = %snapshot, "Started snapshot");
        Ok(())
    }

    async fn snapshot_state(&self, repository: &str, snapshot: &str) -> ClusterResult<SnapshotState> {
        let body = self
            .get(&format!("_snapshot/{}/{}", repository, snapshot))
            .await?;
        parse_snapshot_state(&body)
    }

    async fn open_index(&self, index: &str) -> ClusterResult<()> {
        self.post_empty(&format!("{}/_open", index)).await?;
        Ok(())
    }

    async fn close_index(&self, index: &str) -> ClusterResult<()> {
        self.post_empty(&format!("{}/_close", index)).await?;
        Ok(())
    }

    async fn evaluate_script(&self, index: &str, script: &Script) -> ClusterResult<bool> {
        let body = self
            .post(
                &format!("{}/_search", index),
                &script_query(&script.source, &script.lang),
            )
            .await?;
        parse_script_hits(&body)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<IndexEvent> {
        self.events.subscribe()
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }
}
