//! Translation between REST payloads and cluster client types
//!
//! Every function here is pure so the payload handling can be tested
//! without a live cluster.

use chrono::{DateTime, TimeZone, Utc};
use ism_actions::{ClusterError, ClusterResult, NodeInfo, SettingsUpdate, SnapshotState};
use ism_api::{IndexHealth, IndexState, IndexStats};
use reqwest::StatusCode;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

/// Index setting naming the alias an index rolls over through
pub const ROLLOVER_ALIAS_SETTING: &str = "index.plugins.index_state_management.rollover_alias";

/// Columns requested from the index catalogue
pub const CAT_INDICES_COLUMNS: &str =
    "index,uuid,health,status,pri,rep,docs.count,store.size,creation.date";

/// Classify a transport failure
pub fn request_error(e: &reqwest::Error) -> ClusterError {
    if e.is_timeout() {
        ClusterError::Timeout(e.to_string())
    } else if e.is_connect() || e.is_request() {
        ClusterError::Unavailable(e.to_string())
    } else if e.is_decode() {
        ClusterError::Internal(format!("Malformed response: {}", e))
    } else {
        ClusterError::Unavailable(e.to_string())
    }
}

/// Classify a non-success HTTP status
pub fn status_error(status: StatusCode, body: &str) -> ClusterError {
    let reason = error_reason(body).unwrap_or_else(|| status.to_string());
    match status {
        StatusCode::NOT_FOUND => ClusterError::NotFound(reason),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ClusterError::Timeout(reason),
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE => ClusterError::Unavailable(reason),
        s if s.is_client_error() => ClusterError::Rejected(reason),
        _ => ClusterError::Internal(reason),
    }
}

/// The `error.reason` of an error response, when there is one
fn error_reason(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    match value.get("error")? {
        Value::String(s) => Some(s.clone()),
        error => error
            .get("reason")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

fn malformed(what: &str) -> ClusterError {
    ClusterError::Internal(format!("Malformed response: missing {}", what))
}

/// Numbers arrive as JSON numbers or as strings depending on the endpoint
fn as_u64(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn as_bool(value: Option<&Value>) -> Option<bool> {
    match value? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn millis(ms: u64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(i64::try_from(ms).ok()?).single()
}

/// Parse `_cat/indices?format=json` rows
pub fn parse_cat_indices(body: &Value) -> ClusterResult<Vec<IndexStats>> {
    body.as_array()
        .ok_or_else(|| malformed("index rows"))?
        .iter()
        .map(parse_cat_index_row)
        .collect()
}

pub fn parse_cat_index_row(row: &Value) -> ClusterResult<IndexStats> {
    let index = row
        .get("index")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("index"))?;
    let uuid = row
        .get("uuid")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("uuid"))?;
    let creation_date = as_u64(row.get("creation.date"))
        .and_then(millis)
        .ok_or_else(|| malformed("creation.date"))?;

    let mut stats = IndexStats::new(index, uuid, creation_date);
    stats.doc_count = as_u64(row.get("docs.count")).unwrap_or(0);
    stats.size_bytes = as_u64(row.get("store.size")).unwrap_or(0);
    stats.primary_shards = as_u64(row.get("pri")).map_or(1, |n| n as u32);
    stats.replicas = as_u64(row.get("rep")).map_or(0, |n| n as u32);
    stats.state = match row.get("status").and_then(Value::as_str) {
        Some("close") => IndexState::Close,
        _ => IndexState::Open,
    };
    stats.health = match row.get("health").and_then(Value::as_str) {
        Some("yellow") => IndexHealth::Yellow,
        Some("red") => IndexHealth::Red,
        _ => IndexHealth::Green,
    };
    Ok(stats)
}

/// Fold `GET /{index}?flat_settings=true` into `stats`: settings and aliases
pub fn apply_index_settings(stats: &mut IndexStats, body: &Value) {
    let Some(index) = body.get(&stats.index) else {
        return;
    };

    if let Some(settings) = index.get("settings") {
        stats.read_only = as_bool(settings.get("index.blocks.write")).unwrap_or(false);
        stats.priority = as_u64(settings.get("index.priority")).map(|n| n as u32);
        stats.rollover_alias = settings
            .get(ROLLOVER_ALIAS_SETTING)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
    }

    stats.is_write_index = match (&stats.rollover_alias, index.get("aliases")) {
        (Some(alias), Some(aliases)) => aliases
            .get(alias)
            .is_some_and(|a| as_bool(a.get("is_write_index")).unwrap_or(false)),
        _ => false,
    };
}

/// Fold `_stats/store,segments?level=shards` into `stats`
pub fn apply_shard_stats(stats: &mut IndexStats, body: &Value) {
    let Some(shards) = body
        .get("indices")
        .and_then(|i| i.get(&stats.index))
        .and_then(|i| i.get("shards"))
        .and_then(Value::as_object)
    else {
        return;
    };

    let copies = shards.values().filter_map(Value::as_array).flatten();
    for copy in copies {
        let primary = as_bool(copy.get("routing").and_then(|r| r.get("primary"))).unwrap_or(false);
        let size = as_u64(copy.get("store").and_then(|s| s.get("size_in_bytes"))).unwrap_or(0);
        let segments = as_u64(copy.get("segments").and_then(|s| s.get("count"))).unwrap_or(0);

        if primary {
            stats.largest_primary_shard_bytes = stats.largest_primary_shard_bytes.max(size);
        }
        stats.max_segments_per_shard = stats.max_segments_per_shard.max(segments as u32);
    }
}

/// When `index` was rolled over through `alias`, from `_cluster/state/metadata`
pub fn parse_rollover_date(body: &Value, index: &str, alias: &str) -> Option<DateTime<Utc>> {
    let info = body
        .get("metadata")?
        .get("indices")?
        .get(index)?
        .get("rollover_info")?
        .get(alias)?;
    as_u64(info.get("time")).and_then(millis)
}

/// Name of the index created by a rollover
pub fn parse_rollover(body: &Value) -> ClusterResult<String> {
    if as_bool(body.get("rolled_over")) == Some(false) {
        return Err(ClusterError::Rejected("Rollover was not performed".into()));
    }
    body.get("new_index")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| malformed("new_index"))
}

/// Aliases of `index` other than `exclude`, from `GET /{index}/_alias`
pub fn aliases_except(body: &Value, index: &str, exclude: &str) -> Vec<String> {
    body.get(index)
        .and_then(|i| i.get("aliases"))
        .and_then(Value::as_object)
        .map(|aliases| {
            aliases
                .keys()
                .filter(|name| name.as_str() != exclude)
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

fn allocation_settings(kind: &str, attrs: &BTreeMap<String, String>, settings: &mut Map<String, Value>) {
    for (attr, value) in attrs {
        settings.insert(
            format!("index.routing.allocation.{}.{}", kind, attr),
            Value::String(value.clone()),
        );
    }
}

/// Body of `PUT /{index}/_settings`
pub fn settings_body(update: &SettingsUpdate) -> Value {
    match update {
        SettingsUpdate::ReadOnly(read_only) => json!({ "index.blocks.write": read_only }),
        SettingsUpdate::NumberOfReplicas(n) => json!({ "index.number_of_replicas": n }),
        SettingsUpdate::Priority(p) => json!({ "index.priority": p }),
        SettingsUpdate::Allocation {
            require,
            include,
            exclude,
        } => {
            let mut settings = Map::new();
            allocation_settings("require", require, &mut settings);
            allocation_settings("include", include, &mut settings);
            allocation_settings("exclude", exclude, &mut settings);
            Value::Object(settings)
        }
    }
}

/// Body of `POST /{source}/_shrink/{target}`
pub fn shrink_body(num_shards: u32) -> Value {
    json!({
        "settings": {
            "index.number_of_shards": num_shards,
            "index.routing.allocation.require._name": null,
            "index.blocks.write": null,
        }
    })
}

/// Data nodes from `_nodes/stats/fs`, sorted by name
pub fn parse_nodes(body: &Value) -> ClusterResult<Vec<NodeInfo>> {
    let nodes = body
        .get("nodes")
        .and_then(Value::as_object)
        .ok_or_else(|| malformed("nodes"))?;

    let mut result: Vec<NodeInfo> = nodes
        .values()
        .filter(|node| {
            node.get("roles")
                .and_then(Value::as_array)
                .is_none_or(|roles| roles.iter().any(|r| r.as_str() == Some("data")))
        })
        .filter_map(|node| {
            let name = node.get("name")?.as_str()?;
            let free = as_u64(
                node.get("fs")
                    .and_then(|fs| fs.get("total"))
                    .and_then(|t| t.get("available_in_bytes")),
            )
            .unwrap_or(0);
            Some(NodeInfo {
                name: name.to_string(),
                free_bytes: free,
            })
        })
        .collect();
    result.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(result)
}

/// Whether every shard in `_cat/shards?format=json` has a started copy on `node`
/// and nothing is still relocating
pub fn shards_on_node(body: &Value, node: &str) -> ClusterResult<bool> {
    let rows = body.as_array().ok_or_else(|| malformed("shard rows"))?;
    if rows.is_empty() {
        return Ok(false);
    }

    let mut placed: BTreeMap<u64, bool> = BTreeMap::new();
    for row in rows {
        let shard = as_u64(row.get("shard")).ok_or_else(|| malformed("shard"))?;
        let state = row.get("state").and_then(Value::as_str).unwrap_or("");
        if state == "RELOCATING" || state == "INITIALIZING" {
            return Ok(false);
        }
        let here = state == "STARTED" && row.get("node").and_then(Value::as_str) == Some(node);
        *placed.entry(shard).or_insert(false) |= here;
    }
    Ok(placed.values().all(|here| *here))
}

/// State of the snapshot in `GET /_snapshot/{repo}/{snapshot}`
pub fn parse_snapshot_state(body: &Value) -> ClusterResult<SnapshotState> {
    let snapshot = body
        .get("snapshots")
        .and_then(Value::as_array)
        .and_then(|s| s.first())
        .ok_or_else(|| ClusterError::NotFound("snapshot".into()))?;

    let state = snapshot
        .get("state")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("snapshot state"))?;
    Ok(match state {
        "SUCCESS" => SnapshotState::Success,
        "IN_PROGRESS" | "STARTED" => SnapshotState::InProgress,
        other => {
            let reason = snapshot
                .get("reason")
                .and_then(Value::as_str)
                .map(|r| format!("{}: {}", other, r))
                .unwrap_or_else(|| other.to_string());
            SnapshotState::Failed(reason)
        }
    })
}

/// Body of the search a transition script is evaluated with
pub fn script_query(source: &str, lang: &str) -> Value {
    json!({
        "size": 0,
        "track_total_hits": 1,
        "query": {
            "script": {
                "script": { "source": source, "lang": lang }
            }
        }
    })
}

/// A script holds when at least one document matches it
pub fn parse_script_hits(body: &Value) -> ClusterResult<bool> {
    let total = body
        .get("hits")
        .and_then(|h| h.get("total"))
        .ok_or_else(|| malformed("hits.total"))?;
    let hits = as_u64(Some(total)).or_else(|| as_u64(total.get("value")));
    hits.map(|n| n > 0).ok_or_else(|| malformed("hits.total.value"))
}
