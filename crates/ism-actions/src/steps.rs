//! Steps backing every action of the policy vocabulary
//!
//! Each action runs as an ordered list of steps (see
//! `ActionKind::step_names`). A step is started once and then executed on
//! every tick until it reports a terminal status, so `execute` must be safe
//! to call repeatedly.

use ism_api::{ActionProperties, IndexState, IndexStats, ShrinkProperties, ValidationResult};
use ism_config::{
    ActionConfig, ActionKind, AllocationParams, RolloverParams, ShrinkParams, SnapshotParams,
};
use serde_json::json;
use tracing::debug;

use crate::step::transient_or;
use crate::{
    ClusterError, SettingsUpdate, SnapshotState, StepContext, StepError, StepOutcome, StepResult,
    classify,
};

/// One step of an action, bound to the action's parameters
#[derive(Debug, Clone, Copy)]
pub struct Step<'a> {
    name: &'static str,
    op: StepOp<'a>,
}

#[derive(Debug, Clone, Copy)]
enum StepOp<'a> {
    Rollover(&'a RolloverParams),
    Delete,
    SetReadOnly(bool),
    CallForceMerge(u32),
    WaitForForceMerge(u32),
    MoveShards(&'a ShrinkParams),
    WaitForMoveShards,
    Shrink,
    WaitForShrink,
    Snapshot(&'a SnapshotParams),
    WaitForSnapshot(&'a SnapshotParams),
    ReplicaCount(u32),
    IndexPriority(u32),
    Open,
    Close,
    Allocation(&'a AllocationParams),
}

impl<'a> Step<'a> {
    /// The step named `step_name` of `action`, if the action has such a step
    pub fn for_action(action: &'a ActionConfig, step_name: &str) -> Option<Self> {
        let kind = &action.kind;
        let position = kind.step_names().iter().position(|s| *s == step_name)?;
        let name = kind.step_names()[position];

        let op = match (kind, position) {
            (ActionKind::Rollover(p), _) => StepOp::Rollover(p),
            (ActionKind::Delete(_), _) => StepOp::Delete,
            (ActionKind::ForceMerge(_), 0) => StepOp::SetReadOnly(true),
            (ActionKind::ForceMerge(p), 1) => StepOp::CallForceMerge(p.max_num_segments),
            (ActionKind::ForceMerge(p), _) => StepOp::WaitForForceMerge(p.max_num_segments),
            (ActionKind::Shrink(p), 0) => StepOp::MoveShards(p),
            (ActionKind::Shrink(_), 1) => StepOp::WaitForMoveShards,
            (ActionKind::Shrink(_), 2) => StepOp::Shrink,
            (ActionKind::Shrink(_), _) => StepOp::WaitForShrink,
            (ActionKind::Snapshot(p), 0) => StepOp::Snapshot(p),
            (ActionKind::Snapshot(p), _) => StepOp::WaitForSnapshot(p),
            (ActionKind::ReplicaCount(p), _) => StepOp::ReplicaCount(p.number_of_replicas),
            (ActionKind::ReadOnly(_), _) => StepOp::SetReadOnly(true),
            (ActionKind::ReadWrite(_), _) => StepOp::SetReadOnly(false),
            (ActionKind::IndexPriority(p), _) => StepOp::IndexPriority(p.priority),
            (ActionKind::Open(_), _) => StepOp::Open,
            (ActionKind::Close(_), _) => StepOp::Close,
            (ActionKind::Allocation(p), _) => StepOp::Allocation(p),
        };

        Some(Self { name, op })
    }

    /// The first step of `action`
    pub fn first(action: &'a ActionConfig) -> Option<Self> {
        Self::for_action(action, action.kind.first_step())
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Check that the action can apply to the index as it is now
    pub async fn validate(&self, ctx: &StepContext<'_>) -> StepOutcome<ValidationResult> {
        let stats = match transient_or(ctx.cluster.index_stats(ctx.index).await)? {
            Ok(stats) => stats,
            Err(ClusterError::NotFound(_)) => {
                return Ok(ValidationResult::failed(format!("No such index [index={}]", ctx.index)));
            }
            Err(e) => {
                return Ok(ValidationResult::revalidate(format!(
                    "Unable to read index [index={}]: {}",
                    ctx.index, e
                )));
            }
        };

        let problem = match self.op {
            StepOp::Rollover(_) if ctx.metadata.rolled_over => None,
            StepOp::Rollover(_) => rollover_alias(&stats, ctx.index).err(),
            StepOp::Delete => write_index_alias(&stats).map(|alias| {
                format!(
                    "Index [index={}] is the write index for rollover alias [alias={}] and cannot be deleted",
                    ctx.index, alias
                )
            }),
            StepOp::MoveShards(params) => {
                if stats.replicas == 0 && !params.force_unsafe {
                    Some(format!(
                        "Index [index={}] has no replicas; shrinking requires force_unsafe",
                        ctx.index
                    ))
                } else {
                    shrink_target_shards(params, &stats).err()
                }
            }
            StepOp::CallForceMerge(_) | StepOp::SetReadOnly(_) | StepOp::Snapshot(_)
                if stats.state == IndexState::Close =>
            {
                Some(format!("Index [index={}] is closed", ctx.index))
            }
            _ => None,
        };

        Ok(match problem {
            Some(message) => ValidationResult::failed(message),
            None => ValidationResult::passed(format!("Validated action for [index={}]", ctx.index)),
        })
    }

    /// Prepare the step and return the action properties to record with it
    pub async fn start(&self, ctx: &StepContext<'_>) -> StepOutcome<ActionProperties> {
        let mut properties = ctx.properties();

        match self.op {
            StepOp::CallForceMerge(n) | StepOp::WaitForForceMerge(n) => {
                properties.max_num_segments = Some(n);
            }
            StepOp::Snapshot(params) => {
                properties.snapshot_name = Some(snapshot_name(params, ctx));
            }
            _ => {}
        }

        debug!(index = %ctx.index, step = self.name, "Step started");
        Ok(properties)
    }

    /// Perform or poll the step
    pub async fn execute(&self, ctx: &StepContext<'_>) -> StepOutcome<(StepResult, ActionProperties)> {
        let mut properties = ctx.properties();

        let result = match self.op {
            StepOp::Rollover(params) => attempt_rollover(params, ctx).await?,
            StepOp::Delete => attempt_delete(ctx).await?,
            StepOp::SetReadOnly(read_only) => set_read_only(read_only, ctx).await?,
            StepOp::CallForceMerge(n) => {
                match transient_or(ctx.cluster.force_merge(ctx.index, n).await)? {
                    Ok(()) => StepResult::completed(format!(
                        "Successfully started force merge [index={}]",
                        ctx.index
                    )),
                    Err(e) => classify(e, "Failed to start force merge")?,
                }
            }
            StepOp::WaitForForceMerge(n) => {
                let stats = match transient_or(ctx.cluster.index_stats(ctx.index).await)? {
                    Ok(stats) => stats,
                    Err(e) => return Ok((classify(e, "Failed to read segment count")?, properties)),
                };
                if stats.max_segments_per_shard <= n {
                    StepResult::completed(format!("Successfully force merged [index={}]", ctx.index))
                } else {
                    StepResult::running(format!(
                        "Waiting for force merge to complete [index={}]",
                        ctx.index
                    ))
                    .with_info("shard_segments", stats.max_segments_per_shard)
                }
            }
            StepOp::MoveShards(params) => {
                let (result, shrink) = attempt_move_shards(params, ctx).await?;
                if shrink.is_some() {
                    properties.shrink = shrink;
                }
                result
            }
            StepOp::WaitForMoveShards => {
                let shrink = shrink_properties(&properties)?;
                match transient_or(ctx.cluster.shards_relocated(ctx.index, &shrink.node_name).await)? {
                    Ok(true) => StepResult::completed(format!(
                        "Successfully moved shards to [node={}]",
                        shrink.node_name
                    )),
                    Ok(false) => StepResult::running(format!(
                        "Waiting for shards to move to [node={}]",
                        shrink.node_name
                    )),
                    Err(e) => classify(e, "Failed to check shard allocation")?,
                }
            }
            StepOp::Shrink => {
                let shrink = shrink_properties(&properties)?;
                match transient_or(
                    ctx.cluster
                        .shrink_index(ctx.index, &shrink.target_index_name, shrink.target_num_shards)
                        .await,
                )? {
                    Ok(()) => StepResult::completed(format!(
                        "Successfully started shrink into [index={}]",
                        shrink.target_index_name
                    )),
                    Err(e) => classify(e, "Failed to shrink index")?,
                }
            }
            StepOp::WaitForShrink => {
                let shrink = shrink_properties(&properties)?;
                match transient_or(ctx.cluster.index_stats(&shrink.target_index_name).await)? {
                    Ok(stats) if stats.health == ism_api::IndexHealth::Green => StepResult::completed(
                        format!("Successfully shrunk into [index={}]", shrink.target_index_name),
                    ),
                    Ok(_) | Err(ClusterError::NotFound(_)) => StepResult::running(format!(
                        "Waiting for shrunken index [index={}] to become green",
                        shrink.target_index_name
                    )),
                    Err(e) => classify(e, "Failed to read shrunken index")?,
                }
            }
            StepOp::Snapshot(params) => {
                let name = match &properties.snapshot_name {
                    Some(name) => name.clone(),
                    None => {
                        let name = snapshot_name(params, ctx);
                        properties.snapshot_name = Some(name.clone());
                        name
                    }
                };
                match transient_or(
                    ctx.cluster
                        .create_snapshot(&params.repository, &name, ctx.index)
                        .await,
                )? {
                    Ok(()) => StepResult::completed(format!("Successfully started snapshot [snapshot={}]", name)),
                    Err(e) => classify(e, "Failed to create snapshot")?,
                }
            }
            StepOp::WaitForSnapshot(params) => {
                let name = properties.snapshot_name.clone().ok_or_else(|| {
                    StepError::Validation("Snapshot name missing from action properties".into())
                })?;
                match transient_or(ctx.cluster.snapshot_state(&params.repository, &name).await)? {
                    Ok(SnapshotState::Success) => {
                        StepResult::completed(format!("Successfully created snapshot [snapshot={}]", name))
                    }
                    Ok(SnapshotState::InProgress) => {
                        StepResult::running(format!("Waiting for snapshot to complete [snapshot={}]", name))
                    }
                    Ok(SnapshotState::Failed(reason)) => {
                        StepResult::failed(format!("Snapshot failed [snapshot={}]", name))
                            .with_info("cause", reason)
                    }
                    Err(e) => classify(e, "Failed to read snapshot state")?,
                }
            }
            StepOp::ReplicaCount(n) => {
                update_settings(ctx, SettingsUpdate::NumberOfReplicas(n), "Successfully set number_of_replicas")
                    .await?
            }
            StepOp::IndexPriority(p) => {
                update_settings(ctx, SettingsUpdate::Priority(p), "Successfully set index priority").await?
            }
            StepOp::Allocation(params) => {
                let update = SettingsUpdate::Allocation {
                    require: params.require.clone(),
                    include: params.include.clone(),
                    exclude: params.exclude.clone(),
                };
                update_settings(ctx, update, "Successfully updated allocation").await?
            }
            StepOp::Open => match transient_or(ctx.cluster.open_index(ctx.index).await)? {
                Ok(()) => StepResult::completed(format!("Successfully opened index [index={}]", ctx.index)),
                Err(e) => classify(e, "Failed to open index")?,
            },
            StepOp::Close => match transient_or(ctx.cluster.close_index(ctx.index).await)? {
                Ok(()) => StepResult::completed(format!("Successfully closed index [index={}]", ctx.index)),
                Err(e) => classify(e, "Failed to close index")?,
            },
        };

        debug!(index = %ctx.index, step = self.name, status = %result.status, "Step executed");
        Ok((result, properties))
    }
}

fn rollover_alias<'s>(stats: &'s IndexStats, index: &str) -> Result<&'s str, String> {
    let alias = stats
        .rollover_alias
        .as_deref()
        .ok_or_else(|| format!("Missing rollover_alias index setting [index={}]", index))?;
    if !stats.is_write_index {
        return Err(format!(
            "Index [index={}] is not the write index for rollover alias [alias={}]",
            index, alias
        ));
    }
    Ok(alias)
}

fn write_index_alias(stats: &IndexStats) -> Option<&str> {
    match &stats.rollover_alias {
        Some(alias) if stats.is_write_index => Some(alias),
        _ => None,
    }
}

/// Whether any configured rollover condition holds; true when none is configured
pub fn rollover_conditions_met(
    params: &RolloverParams,
    stats: &IndexStats,
    now: chrono::DateTime<chrono::Utc>,
) -> bool {
    if !params.has_conditions() {
        return true;
    }
    params.min_size.is_some_and(|s| stats.size_bytes >= s.as_u64())
        || params.min_doc_count.is_some_and(|c| stats.doc_count >= c)
        || params
            .min_index_age
            .is_some_and(|a| stats.age(now) >= a.to_chrono())
        || params
            .min_primary_shard_size
            .is_some_and(|s| stats.largest_primary_shard_bytes >= s.as_u64())
}

async fn attempt_rollover(params: &RolloverParams, ctx: &StepContext<'_>) -> StepOutcome<StepResult> {
    if ctx.metadata.rolled_over {
        return Ok(StepResult::condition_not_met(format!(
            "Index has already been rolled over [index={}]",
            ctx.index
        )));
    }

    let stats = match transient_or(ctx.cluster.index_stats(ctx.index).await)? {
        Ok(stats) => stats,
        Err(e) => return classify(e, "Failed to read index stats"),
    };
    let alias = rollover_alias(&stats, ctx.index).map_err(StepError::Validation)?;

    if !rollover_conditions_met(params, &stats, ctx.now) {
        let age = stats.age(ctx.now);
        return Ok(StepResult::running(format!("Pending rollover of index [index={}]", ctx.index))
            .with_info(
                "conditions",
                json!({
                    "min_size": params.min_size.map(|s| s.to_string()),
                    "min_doc_count": params.min_doc_count,
                    "min_index_age": params.min_index_age.map(|a| a.to_string()),
                    "min_primary_shard_size": params.min_primary_shard_size.map(|s| s.to_string()),
                    "current": {
                        "size_bytes": stats.size_bytes,
                        "doc_count": stats.doc_count,
                        "index_age_seconds": age.num_seconds(),
                        "largest_primary_shard_bytes": stats.largest_primary_shard_bytes,
                    }
                }),
            ));
    }

    match transient_or(ctx.cluster.rollover(alias, params.copy_alias).await)? {
        Ok(new_index) => {
            let mut result = StepResult::completed(format!("Successfully rolled over index [index={}]", ctx.index))
                .with_info("new_index", new_index);
            result.rolled_over = true;
            Ok(result)
        }
        Err(e) => classify(e, "Failed to roll over index"),
    }
}

async fn attempt_delete(ctx: &StepContext<'_>) -> StepOutcome<StepResult> {
    match transient_or(ctx.cluster.index_stats(ctx.index).await)? {
        Ok(stats) => {
            if let Some(alias) = write_index_alias(&stats) {
                return Err(StepError::Validation(format!(
                    "Index [index={}] is the write index for rollover alias [alias={}] and cannot be deleted",
                    ctx.index, alias
                )));
            }
        }
        Err(ClusterError::NotFound(_)) => {
            return Ok(StepResult::completed(format!("Index already deleted [index={}]", ctx.index)));
        }
        Err(e) => return classify(e, "Failed to read index stats"),
    }

    match transient_or(ctx.cluster.delete_index(ctx.index).await)? {
        Ok(()) | Err(ClusterError::NotFound(_)) => {
            Ok(StepResult::completed(format!("Deleted index [index={}]", ctx.index)))
        }
        Err(e) => classify(e, "Failed to delete index"),
    }
}

async fn set_read_only(read_only: bool, ctx: &StepContext<'_>) -> StepOutcome<StepResult> {
    let stats = match transient_or(ctx.cluster.index_stats(ctx.index).await)? {
        Ok(stats) => stats,
        Err(e) => return classify(e, "Failed to read index stats"),
    };

    let mode = if read_only { "read_only" } else { "read_write" };
    if stats.read_only == read_only {
        return Ok(StepResult::condition_not_met(format!(
            "Index is already {} [index={}]",
            mode, ctx.index
        )));
    }

    update_settings(
        ctx,
        SettingsUpdate::ReadOnly(read_only),
        &format!("Successfully set index to {}", mode),
    )
    .await
}

async fn update_settings(
    ctx: &StepContext<'_>,
    update: SettingsUpdate,
    message: &str,
) -> StepOutcome<StepResult> {
    match transient_or(ctx.cluster.update_settings(ctx.index, &update).await)? {
        Ok(()) => Ok(StepResult::completed(format!("{} [index={}]", message, ctx.index))),
        Err(e) => classify(e, "Failed to update index settings"),
    }
}

async fn attempt_move_shards(
    params: &ShrinkParams,
    ctx: &StepContext<'_>,
) -> StepOutcome<(StepResult, Option<ShrinkProperties>)> {
    let stats = match transient_or(ctx.cluster.index_stats(ctx.index).await)? {
        Ok(stats) => stats,
        Err(e) => return Ok((classify(e, "Failed to read index stats")?, None)),
    };
    let target_num_shards = shrink_target_shards(params, &stats).map_err(StepError::Validation)?;

    let nodes = match transient_or(ctx.cluster.list_nodes().await)? {
        Ok(nodes) => nodes,
        Err(e) => return Ok((classify(e, "Failed to list nodes")?, None)),
    };

    // The node must hold a full copy of the primaries plus the shrunken copy
    let required = primary_store_bytes(&stats).saturating_mul(2);
    let node = nodes
        .iter()
        .filter(|n| n.free_bytes >= required)
        .max_by(|a, b| a.free_bytes.cmp(&b.free_bytes).then_with(|| b.name.cmp(&a.name)));
    let node = match node {
        Some(node) => node.name.clone(),
        None => {
            return Ok((
                StepResult::failed(format!(
                    "No node has enough free space to shrink [index={}]",
                    ctx.index
                ))
                .with_info("required_bytes", required),
                None,
            ));
        }
    };

    let update = SettingsUpdate::Allocation {
        require: [("_name".to_string(), node.clone())].into_iter().collect(),
        include: Default::default(),
        exclude: Default::default(),
    };
    let result = update_settings(ctx, update, &format!("Successfully started moving shards to [node={}]", node)).await?;

    let shrink = ShrinkProperties {
        node_name: node,
        target_index_name: params.target_index_name(ctx.index),
        target_num_shards,
    };
    Ok((result, Some(shrink)))
}

fn shrink_properties(properties: &ActionProperties) -> StepOutcome<ShrinkProperties> {
    properties
        .shrink
        .clone()
        .ok_or_else(|| StepError::Validation("Shrink properties missing from action properties".into()))
}

fn primary_store_bytes(stats: &IndexStats) -> u64 {
    stats.size_bytes / (u64::from(stats.replicas) + 1)
}

/// Shard count of the shrunken index. The count must divide the source
/// primary shard count and be smaller than it.
pub fn shrink_target_shards(params: &ShrinkParams, stats: &IndexStats) -> Result<u32, String> {
    let source = stats.primary_shards.max(1);
    let factors: Vec<u32> = (1..=source).filter(|f| source % f == 0).collect();

    let target = if let Some(n) = params.num_new_shards {
        factors.iter().copied().filter(|f| *f <= n).max()
    } else if let Some(max) = params.max_shard_size {
        let max = max.as_u64().max(1);
        let needed = primary_store_bytes(stats).div_ceil(max).max(1);
        factors.iter().copied().find(|f| u64::from(*f) >= needed)
    } else if let Some(pct) = params.percentage_of_source_shards {
        let wanted = ((f64::from(source) * pct).floor() as u32).max(1);
        factors.iter().copied().filter(|f| *f <= wanted).max()
    } else {
        None
    };

    match target {
        Some(t) if t < source => Ok(t),
        _ => Err(format!(
            "Index [index={}] with {} primary shards cannot be shrunk with the given parameters",
            stats.index, source
        )),
    }
}

fn snapshot_name(params: &SnapshotParams, ctx: &StepContext<'_>) -> String {
    format!(
        "{}-{}",
        params.snapshot,
        ctx.now.format("%Y.%m.%d-%H.%M.%S%.3f")
    )
    .to_lowercase()
}
