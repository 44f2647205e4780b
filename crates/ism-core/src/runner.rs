//! The managed index runner
//!
//! One call to [`Runner::run`] is one tick for one index. A tick holds the
//! index's lease while it performs at most one unit of work:
//!
//! - apply a pending policy change at a safe boundary
//! - seed metadata at the policy's default state
//! - start an action or step, or poll a running step
//! - evaluate the state's transitions, or move to the chosen state
//!
//! and persists the result with a version check. Everything the next tick
//! needs is in the persisted config and metadata, so any node can pick up
//! where another left off.

use chrono::{DateTime, Utc};
use ism_actions::{ClusterClient, ClusterError, Step, StepContext, StepError, StepResult};
use ism_api::{
    ActionMetaData, ActionProperties, ChangePolicy, ManagedIndexMetaData, StateMetaData,
    StepMetaData, StepStatus, ValidationStatus, info_message,
};
use ism_config::{
    ActionConfig, ActionResolution, ConditionInputs, ManagedIndexConfig, Policy, State,
};
use ism_store::{DocumentStore, Store, StoreError, Versioned, WriteCondition};
use ism_util::checked_add;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{AbortReason, HistoryWriter, LockLease, LockService, SkipReason, TickOutcome};

/// Why a tick stopped without writing
enum Abort {
    Store(StoreError),
    Cluster(ClusterError),
    LeaseLost,
}

impl From<StoreError> for Abort {
    fn from(e: StoreError) -> Self {
        Abort::Store(e)
    }
}

impl From<ClusterError> for Abort {
    fn from(e: ClusterError) -> Self {
        Abort::Cluster(e)
    }
}

impl From<Abort> for AbortReason {
    fn from(abort: Abort) -> Self {
        match abort {
            Abort::Store(e) if e.is_conflict() => AbortReason::VersionConflict,
            Abort::Store(e) => AbortReason::Store(e.to_string()),
            Abort::Cluster(e) => AbortReason::Cluster(e.to_string()),
            Abort::LeaseLost => AbortReason::LeaseLost,
        }
    }
}

type TickResult = Result<TickOutcome, Abort>;

type Metadata = Versioned<ManagedIndexMetaData>;

/// Drives managed indices through their policies, one tick at a time
pub struct Runner {
    store: Arc<dyn Store>,
    cluster: Arc<dyn ClusterClient>,
    locks: LockService,
    history: HistoryWriter,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl Runner {
    pub fn new(
        store: Arc<dyn Store>,
        cluster: Arc<dyn ClusterClient>,
        locks: LockService,
        history: HistoryWriter,
    ) -> Self {
        Self {
            store,
            cluster,
            locks,
            history,
            clock: Arc::new(ism_util::now),
        }
    }

    /// Replace the wall clock used for lease renewal
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Run one tick for `index` at `now`.
    ///
    /// Never fails: every error is classified into the returned outcome, and
    /// the lease is released on every path that acquired it.
    pub async fn run(&self, index: &str, now: DateTime<Utc>) -> TickOutcome {
        let config = match self.store.get_managed_config(index) {
            Ok(Some(config)) => config,
            Ok(None) => return TickOutcome::Skipped(SkipReason::NotManaged),
            Err(e) => return self.aborted(index, Abort::Store(e)),
        };
        if !config.value.enabled {
            debug!(index = %index, "Job disabled, skipping tick");
            return TickOutcome::Skipped(SkipReason::Disabled);
        }

        let mut lease = match self.locks.acquire(index, now) {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                debug!(index = %index, "Lock contended, skipping tick");
                return TickOutcome::Skipped(SkipReason::LockHeld);
            }
            Err(e) => return self.aborted(index, Abort::Store(e)),
        };

        let outcome = match self.run_locked(config, &mut lease, now).await {
            Ok(outcome) => outcome,
            Err(abort) => self.aborted(index, abort),
        };

        if let Err(e) = self.locks.release(&lease) {
            warn!(index = %index, error = %e, "Failed to release lock");
        }

        match &outcome {
            TickOutcome::Progressed(metadata) => info!(
                index = %index,
                state = ?metadata.state_name(),
                action = ?metadata.action.as_ref().map(|a| a.name.as_str()),
                step = ?metadata.step.as_ref().map(|s| s.name.as_str()),
                status = ?metadata.step_status(),
                message = ?metadata.message(),
                "Managed index progressed"
            ),
            TickOutcome::Unchanged => debug!(index = %index, "Nothing to do"),
            _ => {}
        }

        outcome
    }

    fn aborted(&self, index: &str, abort: Abort) -> TickOutcome {
        let reason = AbortReason::from(abort);
        match &reason {
            AbortReason::VersionConflict => {
                debug!(index = %index, "Metadata changed underneath the tick, abandoning")
            }
            other => warn!(index = %index, reason = ?other, "Tick aborted"),
        }
        TickOutcome::Aborted(reason)
    }

    async fn run_locked(
        &self,
        config: Versioned<ManagedIndexConfig>,
        lease: &mut LockLease,
        now: DateTime<Utc>,
    ) -> TickResult {
        let metadata = self.store.get_metadata(&config.value.index)?;

        let policy = match &config.value.policy {
            Some(policy) => policy.clone(),
            None => return self.load_snapshot(&config, metadata.as_ref(), now),
        };

        if let Some(change) = &config.value.change_policy {
            if at_safe_boundary(metadata.as_ref().map(|m| &m.value), &policy) {
                return self.apply_change_policy(&config, metadata.as_ref(), now);
            }
            debug!(
                index = %config.value.index,
                policy_id = %change.policy_id,
                "Change policy deferred until the state boundary"
            );
        }

        let Some(current) = metadata else {
            return self.initialize(&config.value, &policy, now).await;
        };
        let meta = &current.value;

        if meta.policy_completed || meta.is_failed() {
            return Ok(TickOutcome::Unchanged);
        }

        if meta.policy_id != config.value.policy_id || meta.policy_seq_no != config.value.policy_seq_no {
            let message = format!(
                "Metadata follows policy [policy_id={}] but the index is bound to [policy_id={}]",
                meta.policy_id, config.value.policy_id
            );
            return self.fail_policy(Some(&current), meta.clone(), message, now);
        }

        let state = match meta.state_name().and_then(|name| policy.state(name)) {
            Some(state) => state,
            None => {
                let message = format!(
                    "State [state={}] does not exist in policy [policy_id={}]",
                    meta.state_name().unwrap_or("<none>"),
                    policy.policy_id
                );
                return self.fail_policy(Some(&current), meta.clone(), message, now);
            }
        };

        if let Some(target) = &meta.transition_to {
            return self.move_to_state(&current, &policy, target, now);
        }

        match state.resolve_current_action(meta) {
            Err(e) => self.fail_policy(Some(&current), meta.clone(), e.to_string(), now),
            Ok(ActionResolution::Action {
                index: position,
                action,
                fresh: true,
            }) => self.start_action(&current, action, position, lease, now).await,
            Ok(ActionResolution::Action { action, .. }) => {
                self.continue_action(&current, action, lease, now).await
            }
            Ok(ActionResolution::Transitions) => self.evaluate_transitions(&current, state, now).await,
            Ok(ActionResolution::Exhausted) => {
                let mut next = meta
                    .clone()
                    .with_message(format!("Policy has completed [index={}]", meta.index));
                next.policy_completed = true;
                self.commit(Some(&current), next, now)
            }
        }
    }

    /// Take the policy snapshot a config was attached without
    fn load_snapshot(
        &self,
        config: &Versioned<ManagedIndexConfig>,
        metadata: Option<&Metadata>,
        now: DateTime<Utc>,
    ) -> TickResult {
        let cfg = &config.value;
        match self.store.get_policy(&cfg.policy_id)? {
            Some(policy) => {
                let mut updated = cfg.clone().with_policy(
                    policy.value,
                    policy.version.seq_no,
                    policy.version.primary_term,
                );
                updated.last_updated_time = now;
                self.store
                    .put_managed_config(&updated, WriteCondition::Match(config.version))?;
                info!(
                    index = %cfg.index,
                    policy_id = %cfg.policy_id,
                    seq_no = policy.version.seq_no,
                    "Loaded policy snapshot"
                );
                Ok(TickOutcome::Unchanged)
            }
            None => {
                let base = metadata.map(|m| m.value.clone()).unwrap_or_else(|| {
                    ManagedIndexMetaData::new(&cfg.index, &cfg.index_uuid, cfg.policy_id.clone())
                });
                let message = format!("Could not load policy [policy_id={}]", cfg.policy_id);
                self.fail_policy(metadata, base, message, now)
            }
        }
    }

    /// Seed metadata at the policy's default state
    async fn initialize(
        &self,
        config: &ManagedIndexConfig,
        policy: &Policy,
        now: DateTime<Utc>,
    ) -> TickResult {
        let mut metadata =
            ManagedIndexMetaData::new(&config.index, &config.index_uuid, config.policy_id.clone());
        metadata.policy_seq_no = config.policy_seq_no;
        metadata.policy_primary_term = config.policy_primary_term;

        match self.cluster.index_stats(&config.index).await {
            Ok(stats) => {
                metadata.index_creation_date = Some(stats.creation_date);
                metadata.rolled_over = stats.rollover_date.is_some();
            }
            Err(e) if e.is_transient() => return Err(e.into()),
            Err(e) => {
                let message = format!("Failed to read index [index={}]: {}", config.index, e);
                return self.fail_policy(None, metadata, message, now);
            }
        }

        let Some(initial) = policy.initial_state() else {
            let message = format!(
                "Default state [state={}] does not exist in policy [policy_id={}]",
                policy.default_state, policy.policy_id
            );
            return self.fail_policy(None, metadata, message, now);
        };

        metadata.state = Some(StateMetaData {
            name: initial.name.clone(),
            start_time: now,
        });
        let metadata =
            metadata.with_message(format!("Successfully initialized policy: {}", config.policy_id));
        self.commit(None, metadata, now)
    }

    fn move_to_state(
        &self,
        current: &Metadata,
        policy: &Policy,
        target: &str,
        now: DateTime<Utc>,
    ) -> TickResult {
        let meta = &current.value;
        if policy.state(target).is_none() {
            let message = format!(
                "Transition target [state={}] does not exist in policy [policy_id={}]",
                target, policy.policy_id
            );
            return self.fail_policy(Some(current), meta.clone(), message, now);
        }

        let mut next = meta.clone();
        next.state = Some(StateMetaData {
            name: target.to_string(),
            start_time: now,
        });
        next.action = None;
        next.step = None;
        next.transition_to = None;
        next.info = info_message(format!("Transitioning to {} [index={}]", target, meta.index));
        self.commit(Some(current), next, now)
    }

    /// Validate and start the first step of an action that has not run yet
    async fn start_action(
        &self,
        current: &Metadata,
        action: &ActionConfig,
        position: usize,
        lease: &mut LockLease,
        now: DateTime<Utc>,
    ) -> TickResult {
        let mut base = current.value.clone();
        base.action = None;
        base.step = None;

        let Some(step) = Step::first(action) else {
            let message = format!("Action [action={}] has no steps", action.name());
            return self.fail_policy(Some(current), base, message, now);
        };

        self.renew(lease, now)?;
        let ctx = self.context(&base, now);

        let validation = match step.validate(&ctx).await {
            Ok(validation) => validation,
            Err(StepError::Transient(e)) => return Err(e.into()),
            Err(StepError::Validation(message)) => {
                return self.fail_policy(Some(current), base.clone(), message, now);
            }
        };
        match validation.status {
            ValidationStatus::Passed => {}
            ValidationStatus::Revalidate => {
                debug!(index = %base.index, message = %validation.message, "Action not valid yet");
                return Ok(TickOutcome::Unchanged);
            }
            ValidationStatus::Failed => {
                let mut failed = base.clone();
                failed.action = Some(ActionMetaData::new(action.name(), position, now));
                return self.fail_policy(Some(current), failed, validation.message, now);
            }
        }

        let properties = match step.start(&ctx).await {
            Ok(properties) => properties,
            Err(StepError::Transient(e)) => return Err(e.into()),
            Err(StepError::Validation(message)) => {
                return self.fail_policy(Some(current), base.clone(), message, now);
            }
        };

        let mut action_meta = ActionMetaData::new(action.name(), position, now);
        action_meta.properties = properties;

        let mut next = base.clone();
        next.action = Some(action_meta);
        next.step = Some(StepMetaData::new(step.name(), now, StepStatus::Running));
        next.info = info_message(format!(
            "Starting action {} [index={}]",
            action.name(),
            base.index
        ));
        self.commit(Some(current), next, now)
    }

    /// Advance an action that is already underway
    async fn continue_action(
        &self,
        current: &Metadata,
        action: &ActionConfig,
        lease: &mut LockLease,
        now: DateTime<Utc>,
    ) -> TickResult {
        let meta = &current.value;
        let Some(action_meta) = &meta.action else {
            let message = format!("No action recorded for [index={}]", meta.index);
            return self.fail_policy(Some(current), meta.clone(), message, now);
        };

        let step_name = meta
            .step
            .as_ref()
            .map(|s| s.name.as_str())
            .unwrap_or_else(|| action.kind.first_step());

        match meta.step_status().unwrap_or(StepStatus::Starting) {
            StepStatus::Running => self.execute_step(current, action, step_name, lease, now).await,
            StepStatus::Completed | StepStatus::ConditionNotMet => {
                match action.kind.next_step(step_name) {
                    Some(next_step) => self.start_step(current, action, next_step, lease, now).await,
                    None => {
                        let message = format!(
                            "Step [step={}] is not part of action [action={}]",
                            step_name,
                            action.name()
                        );
                        self.fail_policy(Some(current), meta.clone(), message, now)
                    }
                }
            }
            StepStatus::Starting | StepStatus::Failed => {
                if let Some(retry_after) = action_meta.retry_after {
                    if now < retry_after {
                        debug!(index = %meta.index, retry_after = %retry_after, "Step backing off");
                        return Ok(TickOutcome::Skipped(SkipReason::BackingOff));
                    }
                }
                self.start_step(current, action, step_name, lease, now).await
            }
        }
    }

    async fn start_step(
        &self,
        current: &Metadata,
        action: &ActionConfig,
        step_name: &str,
        lease: &mut LockLease,
        now: DateTime<Utc>,
    ) -> TickResult {
        let meta = &current.value;
        let Some(step) = Step::for_action(action, step_name) else {
            let message = format!(
                "Step [step={}] is not part of action [action={}]",
                step_name,
                action.name()
            );
            return self.fail_policy(Some(current), meta.clone(), message, now);
        };

        self.renew(lease, now)?;
        let ctx = self.context(meta, now);
        let properties = match step.start(&ctx).await {
            Ok(properties) => properties,
            Err(StepError::Transient(e)) => return Err(e.into()),
            Err(StepError::Validation(message)) => {
                return self.fail_policy(Some(current), meta.clone(), message, now);
            }
        };

        let mut next = meta.clone();
        if let Some(action_meta) = next.action.as_mut() {
            action_meta.properties = properties;
            action_meta.retry_after = None;
        }
        next.step = Some(StepMetaData::new(step.name(), now, StepStatus::Running));
        next.info = info_message(format!("Starting step {} [index={}]", step.name(), meta.index));
        self.commit(Some(current), next, now)
    }

    async fn execute_step(
        &self,
        current: &Metadata,
        action: &ActionConfig,
        step_name: &str,
        lease: &mut LockLease,
        now: DateTime<Utc>,
    ) -> TickResult {
        let meta = &current.value;
        let Some(step) = Step::for_action(action, step_name) else {
            let message = format!(
                "Step [step={}] is not part of action [action={}]",
                step_name,
                action.name()
            );
            return self.fail_policy(Some(current), meta.clone(), message, now);
        };

        if let (Some(timeout), Some(step_meta)) = (action.timeout, &meta.step) {
            if now - step_meta.start_time >= timeout.to_chrono() {
                let result = StepResult::failed(format!(
                    "Action timed out [action={}, timeout={}]",
                    action.name(),
                    timeout
                ));
                return self.handle_failure(current, action, result, None, now);
            }
        }

        self.renew(lease, now)?;
        let ctx = self.context(meta, now);
        let (result, properties) = match step.execute(&ctx).await {
            Ok(outcome) => outcome,
            Err(StepError::Transient(e)) => return Err(e.into()),
            Err(StepError::Validation(message)) => {
                return self.fail_policy(Some(current), meta.clone(), message, now);
            }
        };

        if result.status == StepStatus::Failed {
            return self.handle_failure(current, action, result, Some(properties), now);
        }

        let mut next = meta.clone();
        if let Some(action_meta) = next.action.as_mut() {
            action_meta.properties = properties;
        }
        if let Some(step_meta) = next.step.as_mut() {
            step_meta.status = result.status;
        }
        if result.rolled_over {
            next.rolled_over = true;
        }
        next.info = result.info;

        if next == *meta {
            return Ok(TickOutcome::Unchanged);
        }
        self.commit(Some(current), next, now)
    }

    /// Consume a retry or, with the budget spent, fail the policy
    fn handle_failure(
        &self,
        current: &Metadata,
        action: &ActionConfig,
        result: StepResult,
        properties: Option<ActionProperties>,
        now: DateTime<Utc>,
    ) -> TickResult {
        let mut next = current.value.clone();
        next.info = result.info;

        let Some(action_meta) = next.action.as_mut() else {
            let message = format!("No action recorded for [index={}]", current.value.index);
            return self.fail_policy(Some(current), current.value.clone(), message, now);
        };
        if let Some(properties) = properties {
            action_meta.properties = properties;
        }

        let consumed = action_meta.consumed_retries;
        let backoff = if action.retry.has_budget(consumed) {
            Some(checked_add(now, action.retry.backoff_delay(consumed)))
        } else {
            None
        };

        if let Some(Some(retry_after)) = backoff {
            action_meta.consumed_retries = consumed + 1;
            action_meta.last_retry_time = Some(now);
            action_meta.retry_after = Some(retry_after);
            if let Some(step) = next.step.as_mut() {
                step.status = StepStatus::Starting;
            }
            warn!(
                index = %current.value.index,
                action = action.name(),
                retry = consumed + 1,
                retry_after = %retry_after,
                "Step failed, will retry"
            );
        } else {
            action_meta.failed = true;
            if let Some(step) = next.step.as_mut() {
                step.status = StepStatus::Failed;
            }
            next.policy_retry_info.failed = true;
            next.policy_completed = false;
            if backoff.is_some() {
                next.info = info_message(format!(
                    "Retry backoff out of range [action={}, retry={}]",
                    action.name(),
                    consumed + 1
                ));
            }
            warn!(
                index = %current.value.index,
                action = action.name(),
                retries = consumed,
                "Step failed, retries exhausted"
            );
        }

        self.commit(Some(current), next, now)
    }

    async fn evaluate_transitions(
        &self,
        current: &Metadata,
        state: &State,
        now: DateTime<Utc>,
    ) -> TickResult {
        let meta = &current.value;
        let stats = match self.cluster.index_stats(&meta.index).await {
            Ok(stats) => stats,
            Err(e) if e.is_transient() => return Err(e.into()),
            Err(e) => {
                let message = format!("Failed to read index stats [index={}]: {}", meta.index, e);
                return self.fail_policy(Some(current), meta.clone(), message, now);
            }
        };

        let mut script_outcomes = BTreeMap::new();
        for script in state.transition_scripts() {
            let outcome = match self.cluster.evaluate_script(&meta.index, script).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_transient() => return Err(e.into()),
                Err(e) => {
                    warn!(index = %meta.index, error = %e, "Transition script failed, treating as false");
                    false
                }
            };
            script_outcomes.insert(script.clone(), outcome);
        }

        let inputs = ConditionInputs {
            stats: &stats,
            now,
            script_outcomes: &script_outcomes,
        };
        match state.evaluate_transitions(&inputs) {
            Some(target) => {
                let mut next = meta.clone();
                next.transition_to = Some(target.to_string());
                next.info = info_message(format!("Transitioning to {} [index={}]", target, meta.index));
                self.commit(Some(current), next, now)
            }
            None => {
                debug!(index = %meta.index, state = %state.name, "No transition conditions met");
                Ok(TickOutcome::Unchanged)
            }
        }
    }

    /// Apply or discard the config's pending policy change
    fn apply_change_policy(
        &self,
        config: &Versioned<ManagedIndexConfig>,
        metadata: Option<&Metadata>,
        now: DateTime<Utc>,
    ) -> TickResult {
        let cfg = &config.value;
        let Some(change) = &cfg.change_policy else {
            return Ok(TickOutcome::Unchanged);
        };

        let current_state = metadata.and_then(|m| m.value.state_name());
        let target = if change.admits(current_state) {
            let policy = self.store.get_policy(&change.policy_id)?;
            resolve_change_target(change, policy)
        } else {
            Err(format!(
                "Change policy skipped: index is not in an included state [index={}]",
                cfg.index
            ))
        };

        match target {
            Err(reason) => {
                let mut updated = cfg.clone();
                updated.change_policy = None;
                updated.last_updated_time = now;
                self.store
                    .put_managed_config(&updated, WriteCondition::Match(config.version))?;
                info!(index = %cfg.index, reason = %reason, "Discarded change policy request");

                match metadata {
                    Some(current) => {
                        let next = current.value.clone().with_message(reason);
                        self.commit(Some(current), next, now)
                    }
                    None => Ok(TickOutcome::Unchanged),
                }
            }
            Ok(target) => {
                let mut next = ManagedIndexMetaData::new(
                    &cfg.index,
                    &cfg.index_uuid,
                    target.policy.policy_id.clone(),
                );
                next.policy_seq_no = Some(target.seq_no);
                next.policy_primary_term = Some(target.primary_term);
                if let Some(previous) = metadata {
                    next.index_creation_date = previous.value.index_creation_date;
                    next.rolled_over = previous.value.rolled_over;
                }
                next.state = Some(StateMetaData {
                    name: target.state.clone(),
                    start_time: now,
                });
                next.info = info_message(format!(
                    "Successfully changed policy to {} [index={}]",
                    target.policy.policy_id, cfg.index
                ));

                // Metadata first: if the config write below loses a race the
                // request stays pending and is applied again next tick.
                let outcome = self.commit(metadata, next, now)?;

                let policy_id = target.policy.policy_id.clone();
                let mut updated =
                    cfg.clone()
                        .with_policy(target.policy, target.seq_no, target.primary_term);
                updated.change_policy = None;
                updated.last_updated_time = now;
                self.store
                    .put_managed_config(&updated, WriteCondition::Match(config.version))?;

                info!(
                    index = %cfg.index,
                    policy_id = %policy_id,
                    state = %target.state,
                    "Applied change policy"
                );
                Ok(outcome)
            }
        }
    }

    fn fail_policy(
        &self,
        previous: Option<&Metadata>,
        mut next: ManagedIndexMetaData,
        message: String,
        now: DateTime<Utc>,
    ) -> TickResult {
        if next.is_failed() && next.message() == Some(message.as_str()) {
            return Ok(TickOutcome::Unchanged);
        }

        warn!(index = %next.index, policy_id = %next.policy_id, reason = %message, "Policy failed");
        next.policy_retry_info.failed = true;
        next.policy_completed = false;
        next.info = info_message(message);
        self.commit(previous, next, now)
    }

    /// Persist `next` over `previous` and record history
    fn commit(
        &self,
        previous: Option<&Metadata>,
        next: ManagedIndexMetaData,
        now: DateTime<Utc>,
    ) -> TickResult {
        let condition = match previous {
            Some(previous) => WriteCondition::Match(previous.version),
            None => WriteCondition::Create,
        };
        let version = self.store.put_metadata(&next, condition)?;
        debug!(index = %next.index, seq_no = version.seq_no, "Metadata written");

        self.history.record(previous.map(|p| &p.value), &next, now);
        Ok(TickOutcome::Progressed(Box::new(next)))
    }

    /// Extend the lease from the current clock reading, never earlier than
    /// the tick's own `now`
    fn renew(&self, lease: &mut LockLease, now: DateTime<Utc>) -> Result<(), Abort> {
        let at = (self.clock)().max(now);
        if self.locks.renew(lease, at)? {
            Ok(())
        } else {
            Err(Abort::LeaseLost)
        }
    }

    fn context<'a>(&'a self, metadata: &'a ManagedIndexMetaData, now: DateTime<Utc>) -> StepContext<'a> {
        StepContext {
            index: &metadata.index,
            index_uuid: &metadata.index_uuid,
            cluster: self.cluster.as_ref(),
            metadata,
            now,
        }
    }
}

/// Policy and state a change request resolves to
struct ChangeTarget {
    policy: Policy,
    seq_no: i64,
    primary_term: i64,
    state: String,
}

fn resolve_change_target(
    change: &ChangePolicy,
    policy: Option<Versioned<Policy>>,
) -> Result<ChangeTarget, String> {
    let Some(policy) = policy else {
        return Err(format!(
            "Change policy failed: policy [policy_id={}] not found",
            change.policy_id
        ));
    };

    let state = change
        .state
        .clone()
        .unwrap_or_else(|| policy.value.default_state.clone());
    if policy.value.state(&state).is_none() {
        return Err(format!(
            "Change policy failed: state [state={}] does not exist in policy [policy_id={}]",
            state, change.policy_id
        ));
    }

    Ok(ChangeTarget {
        seq_no: policy.version.seq_no,
        primary_term: policy.version.primary_term,
        policy: policy.value,
        state,
    })
}

/// Whether a pending policy change may be applied now: before any action
/// of the current state ran, once its actions are exhausted, or when the
/// policy is halted.
pub fn at_safe_boundary(metadata: Option<&ManagedIndexMetaData>, policy: &Policy) -> bool {
    let Some(meta) = metadata else {
        return true;
    };
    if meta.is_failed() || meta.policy_completed || meta.transition_to.is_some() || meta.action.is_none() {
        return true;
    }

    match meta.state_name().and_then(|name| policy.state(name)) {
        Some(state) => matches!(
            state.resolve_current_action(meta),
            Ok(ActionResolution::Transitions | ActionResolution::Exhausted)
        ),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use ism_actions::MockCluster;
    use ism_api::IndexStats;
    use ism_config::{JobSchedule, parse_policy};
    use ism_store::SqliteStore;
    use ism_util::{NodeId, TimeValue};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
    }

    struct Harness {
        store: Arc<dyn Store>,
        cluster: Arc<MockCluster>,
        runner: Runner,
    }

    fn harness() -> Harness {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let cluster = Arc::new(MockCluster::new());
        cluster.set_time(t0());
        let runner = runner_for(&store, &cluster, "node-a");
        Harness {
            store,
            cluster,
            runner,
        }
    }

    fn runner_for(store: &Arc<dyn Store>, cluster: &Arc<MockCluster>, node: &str) -> Runner {
        Runner::new(
            store.clone(),
            cluster.clone(),
            LockService::new(store.clone(), NodeId::new(node), std::time::Duration::from_secs(600)),
            HistoryWriter::new(store.clone(), true),
        )
    }

    fn put_policy(store: &Arc<dyn Store>, id: &str, json: &str) -> (Policy, ism_store::Version) {
        let policy = parse_policy(id, json, t0()).unwrap();
        let version = store.put_policy(&policy, WriteCondition::Any).unwrap();
        (policy, version)
    }

    fn attach(store: &Arc<dyn Store>, index: &str, policy_id: &str, json: &str) {
        let (policy, version) = put_policy(store, policy_id, json);
        let config = ManagedIndexConfig::new(
            index,
            format!("{}-uuid", index),
            policy.policy_id.clone(),
            JobSchedule::new(TimeValue::from_secs(300), 0.0),
            t0(),
        )
        .with_policy(policy, version.seq_no, version.primary_term);
        store.put_managed_config(&config, WriteCondition::Create).unwrap();
    }

    fn metadata(store: &Arc<dyn Store>, index: &str) -> ManagedIndexMetaData {
        store.get_metadata(index).unwrap().unwrap().value
    }

    const REPLICAS: &str = r#"{"default_state": "warm", "states": [
        {"name": "warm", "actions": [{"replica_count": {"number_of_replicas": 0},
            "retry": {"count": 2, "backoff": "constant", "delay": "1m"}}]}
    ]}"#;

    #[tokio::test]
    async fn unmanaged_index_is_skipped() {
        let h = harness();
        assert_eq!(
            h.runner.run("nope", t0()).await,
            TickOutcome::Skipped(SkipReason::NotManaged)
        );
    }

    #[tokio::test]
    async fn first_tick_seeds_default_state() {
        let h = harness();
        h.cluster.add_index(IndexStats::new("idx", "idx-uuid", t0()));
        attach(&h.store, "idx", "replicas", REPLICAS);

        let outcome = h.runner.run("idx", t0()).await;
        let meta = outcome.metadata().unwrap();
        assert_eq!(meta.state_name(), Some("warm"));
        assert!(meta.action.is_none());
        assert_eq!(meta.index_creation_date, Some(t0()));
        assert!(h.store.get_lock("idx").unwrap().is_none());
    }

    #[tokio::test]
    async fn action_runs_one_unit_per_tick() {
        let h = harness();
        h.cluster.add_index(IndexStats::new("idx", "idx-uuid", t0()));
        attach(&h.store, "idx", "replicas", REPLICAS);

        h.runner.run("idx", t0()).await;

        let started = h.runner.run("idx", t0()).await;
        let meta = started.metadata().unwrap();
        assert_eq!(meta.action.as_ref().unwrap().name, "replica_count");
        assert_eq!(meta.step_status(), Some(StepStatus::Running));
        assert_eq!(h.cluster.call_count("update_settings"), 0);

        let executed = h.runner.run("idx", t0()).await;
        assert_eq!(executed.metadata().unwrap().step_status(), Some(StepStatus::Completed));
        assert_eq!(h.cluster.call_count("update_settings"), 1);

        // no transitions: the state is exhausted
        let done = h.runner.run("idx", t0()).await;
        assert!(done.metadata().unwrap().policy_completed);
        assert_eq!(h.runner.run("idx", t0()).await, TickOutcome::Unchanged);
    }

    #[tokio::test]
    async fn retry_budget_is_consumed_then_policy_fails() {
        let h = harness();
        h.cluster.add_index(IndexStats::new("idx", "idx-uuid", t0()));
        h.cluster
            .fail_operation("update_settings", Some(ClusterError::Rejected("blocked".into())));
        attach(&h.store, "idx", "replicas", REPLICAS);

        let mut now = t0();
        for _ in 0..20 {
            h.runner.run("idx", now).await;
            now += Duration::minutes(2);
        }

        assert_eq!(h.cluster.call_count("update_settings"), 3);
        let meta = metadata(&h.store, "idx");
        assert!(meta.is_failed());
        assert!(!meta.policy_completed);
        let action = meta.action.unwrap();
        assert!(action.failed);
        assert_eq!(action.consumed_retries, 2);
    }

    #[tokio::test]
    async fn retry_waits_for_backoff() {
        let h = harness();
        h.cluster.add_index(IndexStats::new("idx", "idx-uuid", t0()));
        h.cluster
            .fail_operation("update_settings", Some(ClusterError::Rejected("blocked".into())));
        attach(&h.store, "idx", "replicas", REPLICAS);

        h.runner.run("idx", t0()).await;
        h.runner.run("idx", t0()).await;
        let failed = h.runner.run("idx", t0()).await;
        let action = failed.metadata().unwrap().action.clone().unwrap();
        assert_eq!(action.consumed_retries, 1);
        assert_eq!(action.retry_after, Some(t0() + Duration::minutes(1)));

        assert_eq!(
            h.runner.run("idx", t0() + Duration::seconds(30)).await,
            TickOutcome::Skipped(SkipReason::BackingOff)
        );
        let restarted = h.runner.run("idx", t0() + Duration::minutes(1)).await;
        assert_eq!(restarted.metadata().unwrap().step_status(), Some(StepStatus::Running));
    }

    #[tokio::test]
    async fn validation_failure_fails_without_retry() {
        let h = harness();
        let mut stats = IndexStats::new("logs-000001", "u1", t0());
        stats.rollover_alias = Some("logs".into());
        stats.is_write_index = true;
        h.cluster.add_index(stats);
        attach(
            &h.store,
            "logs-000001",
            "delete-now",
            r#"{"default_state": "gone", "states": [{"name": "gone", "actions": [{"delete": {}}]}]}"#,
        );

        h.runner.run("logs-000001", t0()).await;
        let outcome = h.runner.run("logs-000001", t0()).await;
        let meta = outcome.metadata().unwrap();
        assert!(meta.is_failed());
        assert_eq!(meta.action.as_ref().unwrap().consumed_retries, 0);
        assert!(meta.message().unwrap().contains("write index"));
        assert_eq!(h.cluster.call_count("delete_index"), 0);

        assert_eq!(h.runner.run("logs-000001", t0()).await, TickOutcome::Unchanged);
    }

    #[tokio::test]
    async fn transient_error_aborts_without_writing() {
        let h = harness();
        h.cluster.add_index(IndexStats::new("idx", "idx-uuid", t0()));
        attach(&h.store, "idx", "replicas", REPLICAS);
        h.runner.run("idx", t0()).await;
        let before = h.store.get_metadata("idx").unwrap().unwrap();

        h.cluster.fail_with(Some(ClusterError::Timeout("slow".into())));
        let outcome = h.runner.run("idx", t0()).await;
        assert!(matches!(outcome, TickOutcome::Aborted(AbortReason::Cluster(_))));

        let after = h.store.get_metadata("idx").unwrap().unwrap();
        assert_eq!(before.version, after.version);
        assert!(h.store.get_lock("idx").unwrap().is_none());
    }

    #[tokio::test]
    async fn held_lock_skips_tick() {
        let h = harness();
        h.cluster.add_index(IndexStats::new("idx", "idx-uuid", t0()));
        attach(&h.store, "idx", "replicas", REPLICAS);

        let other = LockService::new(h.store.clone(), NodeId::new("node-b"), std::time::Duration::from_secs(600));
        let lease = other.acquire("idx", t0()).unwrap().unwrap();

        assert_eq!(
            h.runner.run("idx", t0()).await,
            TickOutcome::Skipped(SkipReason::LockHeld)
        );
        assert!(h.store.get_metadata("idx").unwrap().is_none());

        other.release(&lease).unwrap();
        assert!(h.runner.run("idx", t0()).await.is_progressed());
    }

    #[tokio::test]
    async fn lease_is_extended_before_step_calls() {
        let h = harness();
        h.cluster.add_index(IndexStats::new("idx", "idx-uuid", t0()));
        attach(&h.store, "idx", "replicas", REPLICAS);
        h.runner.run("idx", t0()).await;
        h.runner.run("idx", t0()).await;

        let seen = Arc::new(std::sync::Mutex::new(None));
        let store = h.store.clone();
        let observed = seen.clone();
        h.cluster.on_call(move |op| {
            if op == "update_settings" {
                let lock = store.get_lock("idx").unwrap().map(|l| l.value.expires_at);
                *observed.lock().unwrap() = lock;
            }
        });

        // five minutes pass between the tick starting and the step call
        let runner = runner_for(&h.store, &h.cluster, "node-a").with_clock(|| t0() + Duration::minutes(5));
        assert!(runner.run("idx", t0()).await.is_progressed());
        assert_eq!(h.cluster.call_count("update_settings"), 1);
        assert_eq!(*seen.lock().unwrap(), Some(t0() + Duration::minutes(15)));
    }

    #[tokio::test]
    async fn unbounded_backoff_fails_policy_instead_of_overflowing() {
        let h = harness();
        h.cluster.add_index(IndexStats::new("idx", "idx-uuid", t0()));
        h.cluster
            .fail_operation("update_settings", Some(ClusterError::Rejected("blocked".into())));
        attach(
            &h.store,
            "idx",
            "replicas",
            r#"{"default_state": "warm", "states": [
                {"name": "warm", "actions": [{"replica_count": {"number_of_replicas": 0},
                    "retry": {"count": 50, "backoff": "exponential", "delay": "1d"}}]}
            ]}"#,
        );

        let mut now = t0();
        for _ in 0..200 {
            h.runner.run("idx", now).await;
            let meta = metadata(&h.store, "idx");
            if meta.is_failed() {
                break;
            }
            if let Some(retry_after) = meta.action.and_then(|a| a.retry_after) {
                now = now.max(retry_after);
            }
        }

        let meta = metadata(&h.store, "idx");
        assert!(meta.is_failed());
        assert!(meta.message().unwrap().starts_with("Retry backoff out of range"));
        let action = meta.action.unwrap();
        assert!(action.failed);
        assert!(action.consumed_retries < 50);
    }

    #[tokio::test]
    async fn step_timeout_counts_as_failure() {
        let h = harness();
        h.cluster.add_index(IndexStats::new("idx", "idx-uuid", t0()));
        h.cluster.set_snapshot_outcome(ism_actions::SnapshotState::InProgress);
        attach(
            &h.store,
            "idx",
            "snap",
            r#"{"default_state": "s", "states": [{"name": "s", "actions": [
                {"snapshot": {"repository": "repo", "snapshot": "snap"}, "timeout": "1h",
                 "retry": {"count": 0}}]}]}"#,
        );

        h.runner.run("idx", t0()).await; // init
        h.runner.run("idx", t0()).await; // start attempt_snapshot
        h.runner.run("idx", t0()).await; // snapshot requested
        h.runner.run("idx", t0()).await; // start wait_for_snapshot
        let waiting = h.runner.run("idx", t0() + Duration::minutes(30)).await;
        assert_eq!(waiting.metadata().unwrap().step_status(), Some(StepStatus::Running));

        let timed_out = h.runner.run("idx", t0() + Duration::hours(2)).await;
        let meta = timed_out.metadata().unwrap();
        assert!(meta.is_failed());
        assert!(meta.message().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn change_policy_waits_for_state_boundary() {
        let h = harness();
        let mut stats = IndexStats::new("logs-000001", "u1", t0());
        stats.rollover_alias = Some("logs".into());
        stats.is_write_index = true;
        h.cluster.add_index(stats);
        attach(
            &h.store,
            "logs-000001",
            "hot",
            r#"{"default_state": "hot", "states": [
                {"name": "hot", "actions": [{"rollover": {"min_doc_count": 100}}],
                 "transitions": [{"state_name": "cold", "conditions": {"min_index_age": "30d"}}]},
                {"name": "cold"}
            ]}"#,
        );
        put_policy(
            &h.store,
            "archive",
            r#"{"default_state": "frozen", "states": [{"name": "frozen"}]}"#,
        );

        h.runner.run("logs-000001", t0()).await; // init
        h.runner.run("logs-000001", t0()).await; // start rollover
        h.runner.run("logs-000001", t0()).await; // pending rollover

        let mut config = h.store.get_managed_config("logs-000001").unwrap().unwrap();
        config.value.change_policy = Some(ChangePolicy::new("archive"));
        h.store
            .put_managed_config(&config.value, WriteCondition::Match(config.version))
            .unwrap();

        // rollover is still running: the change waits
        h.runner.run("logs-000001", t0()).await;
        let meta = metadata(&h.store, "logs-000001");
        assert_eq!(meta.policy_id.as_str(), "hot");
        assert_eq!(meta.step_status(), Some(StepStatus::Running));

        h.cluster.update_index("logs-000001", |s| s.doc_count = 500);
        let rolled = h.runner.run("logs-000001", t0()).await;
        assert_eq!(rolled.metadata().unwrap().step_status(), Some(StepStatus::Completed));

        let changed = h.runner.run("logs-000001", t0()).await;
        let meta = changed.metadata().unwrap();
        assert_eq!(meta.policy_id.as_str(), "archive");
        assert_eq!(meta.state_name(), Some("frozen"));
        assert!(meta.action.is_none());
        assert!(meta.rolled_over);

        let config = h.store.get_managed_config("logs-000001").unwrap().unwrap().value;
        assert_eq!(config.policy_id.as_str(), "archive");
        assert!(config.change_policy.is_none());
    }

    #[tokio::test]
    async fn change_policy_outside_include_filter_is_discarded() {
        let h = harness();
        h.cluster.add_index(IndexStats::new("idx", "idx-uuid", t0()));
        attach(&h.store, "idx", "replicas", REPLICAS);
        put_policy(&h.store, "other", r#"{"default_state": "x", "states": [{"name": "x"}]}"#);
        h.runner.run("idx", t0()).await;

        let mut config = h.store.get_managed_config("idx").unwrap().unwrap();
        config.value.change_policy = Some(ChangePolicy::new("other").including("hot"));
        h.store
            .put_managed_config(&config.value, WriteCondition::Match(config.version))
            .unwrap();

        let outcome = h.runner.run("idx", t0()).await;
        let meta = outcome.metadata().unwrap();
        assert_eq!(meta.policy_id.as_str(), "replicas");
        assert!(meta.message().unwrap().contains("not in an included state"));
        let config = h.store.get_managed_config("idx").unwrap().unwrap().value;
        assert!(config.change_policy.is_none());
    }

    #[tokio::test]
    async fn policy_version_mismatch_fails_policy() {
        let h = harness();
        h.cluster.add_index(IndexStats::new("idx", "idx-uuid", t0()));
        attach(&h.store, "idx", "replicas", REPLICAS);
        h.runner.run("idx", t0()).await;

        let mut current = h.store.get_metadata("idx").unwrap().unwrap();
        current.value.policy_seq_no = Some(9999);
        h.store
            .put_metadata(&current.value, WriteCondition::Match(current.version))
            .unwrap();

        let outcome = h.runner.run("idx", t0()).await;
        assert!(outcome.metadata().unwrap().is_failed());
    }

    #[tokio::test]
    async fn missing_snapshot_is_loaded_from_store() {
        let h = harness();
        h.cluster.add_index(IndexStats::new("idx", "idx-uuid", t0()));
        let (policy, _) = put_policy(&h.store, "replicas", REPLICAS);
        let config = ManagedIndexConfig::new(
            "idx",
            "idx-uuid",
            policy.policy_id,
            JobSchedule::new(TimeValue::from_secs(300), 0.0),
            t0(),
        );
        h.store.put_managed_config(&config, WriteCondition::Create).unwrap();

        assert_eq!(h.runner.run("idx", t0()).await, TickOutcome::Unchanged);
        let config = h.store.get_managed_config("idx").unwrap().unwrap().value;
        assert!(config.policy.is_some());
        assert!(h.runner.run("idx", t0()).await.is_progressed());
    }

    #[test]
    fn safe_boundary_rules() {
        let policy = parse_policy("replicas", REPLICAS, t0()).unwrap();
        assert!(at_safe_boundary(None, &policy));

        let mut meta = ManagedIndexMetaData::new("idx", "u", "replicas".into());
        meta.state = Some(StateMetaData {
            name: "warm".into(),
            start_time: t0(),
        });
        assert!(at_safe_boundary(Some(&meta), &policy));

        meta.action = Some(ActionMetaData::new("replica_count", 0, t0()));
        meta.step = Some(StepMetaData::new("attempt_set_replica_count", t0(), StepStatus::Running));
        assert!(!at_safe_boundary(Some(&meta), &policy));

        meta.policy_retry_info.failed = true;
        assert!(at_safe_boundary(Some(&meta), &policy));
    }
}
