//! Instance lifecycle.
//!
//! The orchestrator owns every workflow instance from trigger to tombstone:
//!
//! ```text
//! trigger → pending → (provision) → in_progress(stage_0) → … → ready_to_merge/completed → merged
//!                                        │                         ▲
//!                                        └── stuck ────────────────┘  (monitor, heuristic)
//!                                        └── errored
//! ```
//!
//! Each instance is driven by its own task. Mutating operations on one id
//! (advance, merge, delete, restart) are serialised through a per-id lock;
//! different instances never share mutable state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use pipewright_common::{EventCategory, PushMessage};
use serde_json::{Value, json};
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::broadcaster::EventBroadcaster;
use super::db::DbHandle;
use super::logs::LogAggregator;
use super::models::*;
use super::runner::{StageContext, StageRunner};
use super::stage_engine::{self, Recipe};
use super::worktree::{RemovalReport, WorkingCopies};
use crate::config::RuntimeConfig;
use crate::errors::{WorkflowError, WorkflowResult};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn db_err(e: anyhow::Error) -> WorkflowError {
    WorkflowError::Database(e)
}

fn tag(e: WorkflowError, instance_id: Option<&str>) -> WorkflowError {
    match instance_id {
        Some(id) => e.for_instance(id),
        None => e,
    }
}

/// Parse a trigger's declared stage and check it belongs to the recipe.
fn parse_declared(
    recipe: &Recipe,
    declared: &str,
    instance_id: Option<&str>,
) -> WorkflowResult<StagePosition> {
    let position: StagePosition = declared
        .parse()
        .map_err(|e| WorkflowError::validation(instance_id, format!("{}", e)))?;
    match position {
        StagePosition::At(stage) if !recipe.contains(stage) => Err(WorkflowError::validation(
            instance_id,
            format!("declared stage '{}' is not part of recipe {}", stage, recipe),
        )),
        _ => Ok(position),
    }
}

enum Transition {
    Applied(WorkflowInstance, InstanceStatus),
    Unchanged(WorkflowInstance),
    Rejected(InstanceStatus),
    Missing,
}

struct RunHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    config: RuntimeConfig,
    db: DbHandle,
    copies: Arc<dyn WorkingCopies>,
    /// `None` means stages are completed externally through `advance`.
    runner: Option<Arc<dyn StageRunner>>,
    logs: LogAggregator,
    events: EventBroadcaster,
    runs: Mutex<HashMap<String, RunHandle>>,
    id_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        config: RuntimeConfig,
        db: DbHandle,
        copies: Arc<dyn WorkingCopies>,
        runner: Option<Arc<dyn StageRunner>>,
    ) -> Self {
        let events = EventBroadcaster::new(config.broadcast_capacity);
        let logs = LogAggregator::from_config(&config, events.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                db,
                copies,
                runner,
                logs,
                events,
                runs: Mutex::new(HashMap::new()),
                id_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn db(&self) -> &DbHandle {
        &self.inner.db
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.inner.events
    }

    pub fn log_aggregator(&self) -> &LogAggregator {
        &self.inner.logs
    }

    pub fn working_copies(&self) -> &Arc<dyn WorkingCopies> {
        &self.inner.copies
    }

    async fn lock_instance(&self, instance_id: &str) -> OwnedMutexGuard<()> {
        let mutex = lock(&self.inner.id_locks)
            .entry(instance_id.to_string())
            .or_default()
            .clone();
        mutex.lock_owned().await
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        lock(&self.inner.id_locks).len()
    }

    /// Drop the id's lock entry once nobody holds or awaits it.
    fn prune_lock(&self, instance_id: &str) {
        let mut locks = lock(&self.inner.id_locks);
        if locks
            .get(instance_id)
            .is_some_and(|m| Arc::strong_count(m) == 1)
        {
            locks.remove(instance_id);
        }
    }

    fn publish(
        &self,
        instance_id: &str,
        category: EventCategory,
        stage: Option<StagePosition>,
        payload: Value,
    ) {
        self.inner
            .events
            .publish(PushMessage::new(instance_id, category, stage, payload));
    }

    async fn find(&self, instance_id: &str) -> WorkflowResult<Option<WorkflowInstance>> {
        let id = instance_id.to_string();
        self.inner
            .db
            .call(move |db| db.get_instance(&id))
            .await
            .map_err(db_err)
    }

    async fn get_live(&self, instance_id: &str) -> WorkflowResult<WorkflowInstance> {
        match self.find(instance_id).await? {
            Some(instance) if !instance.is_deleted() => Ok(instance),
            _ => Err(WorkflowError::not_found(instance_id, "Instance")),
        }
    }

    async fn record(
        &self,
        instance_id: &str,
        event: ActivityType,
        old: Option<String>,
        new: Option<String>,
    ) -> WorkflowResult<()> {
        let id = instance_id.to_string();
        self.inner
            .db
            .call(move |db| db.record_activity(&id, event, old.as_deref(), new.as_deref()))
            .await
            .map(|_| ())
            .map_err(db_err)
    }

    /// Move an instance to `to`, recording the change and announcing it.
    async fn transition(
        &self,
        instance_id: &str,
        to: InstanceStatus,
        error: Option<String>,
    ) -> WorkflowResult<WorkflowInstance> {
        let id = instance_id.to_string();
        let err = error.clone();
        let outcome = self
            .inner
            .db
            .call(move |db| {
                let Some(current) = db.get_instance(&id)? else {
                    return Ok(Transition::Missing);
                };
                if current.status == to {
                    return Ok(Transition::Unchanged(current));
                }
                if !current.status.can_transition_to(to) {
                    return Ok(Transition::Rejected(current.status));
                }
                let updated = db.update_status(&id, to, err.as_deref())?;
                db.record_activity(
                    &id,
                    ActivityType::StatusChanged,
                    Some(current.status.as_str()),
                    Some(to.as_str()),
                )?;
                Ok(Transition::Applied(updated, current.status))
            })
            .await
            .map_err(db_err)?;

        match outcome {
            Transition::Applied(updated, from) => {
                tracing::info!(instance_id, from = %from, to = %to, "status changed");
                self.publish(
                    instance_id,
                    EventCategory::StatusUpdate,
                    Some(updated.current_stage),
                    json!({ "status": to, "previous": from, "error": error }),
                );
                Ok(updated)
            }
            Transition::Unchanged(current) => Ok(current),
            Transition::Rejected(from) => Err(WorkflowError::validation(
                Some(instance_id),
                format!("cannot move from {} to {}", from, to),
            )),
            Transition::Missing => Err(WorkflowError::not_found(instance_id, "Instance")),
        }
    }

    // ── Trigger / restart ─────────────────────────────────────────────

    /// Start a new instance, or restart one when the declared stage is not
    /// the recipe's first stage.
    pub async fn trigger(&self, req: TriggerRequest) -> WorkflowResult<WorkflowInstance> {
        let requested = req.instance_id.as_deref();
        if let Some(id) = requested {
            validate_instance_id(id)?;
        }
        let recipe = Recipe::parse(&req.recipe_name).map_err(|e| tag(e, requested))?;
        let declared = req
            .declared_current_stage
            .as_deref()
            .map(|s| parse_declared(&recipe, s, requested))
            .transpose()?;

        if declared.is_some_and(|p| p != recipe.initial_position()) {
            let prior = requested.ok_or_else(|| {
                WorkflowError::validation(
                    None,
                    "a trigger declaring a later stage restarts an instance and needs its instance_id",
                )
            })?;
            return self.restart(prior, &recipe, req.external_ticket_ref).await;
        }

        let id = match requested {
            Some(id) => id.to_string(),
            None => new_instance_id(),
        };
        let _guard = self.lock_instance(&id).await;
        if let Some(existing) = self.find(&id).await? {
            let message = if existing.is_deleted() {
                "id belongs to a deleted instance"
            } else {
                "instance already exists"
            };
            return Err(WorkflowError::conflict(&id, message));
        }
        self.create_and_start(&id, &recipe, req.external_ticket_ref, None)
            .await
    }

    /// Tear down the prior instance completely and start a fresh one at the
    /// recipe's first stage under a new id.
    async fn restart(
        &self,
        prior_id: &str,
        recipe: &Recipe,
        ticket_ref: Option<String>,
    ) -> WorkflowResult<WorkflowInstance> {
        self.stop_run(prior_id).await;
        let prior_guard = self.lock_instance(prior_id).await;
        let prior = self.find(prior_id).await?.filter(|p| !p.is_deleted());

        if let Some(prior) = &prior {
            self.publish(
                prior_id,
                EventCategory::StatusUpdate,
                Some(prior.current_stage),
                json!({ "deleted": true, "reason": "restarted" }),
            );
        }
        self.release_resources(prior_id).await;
        let report = self.remove_copy(prior_id).await?;
        if prior.is_some() {
            self.tombstone(prior_id, "restarted").await?;
        }
        drop(prior_guard);
        self.prune_lock(prior_id);

        let ticket_ref = ticket_ref.or_else(|| prior.as_ref().and_then(|p| p.ticket_ref.clone()));
        let new_id = new_instance_id();
        let _new_guard = self.lock_instance(&new_id).await;
        let instance = self
            .create_and_start(&new_id, recipe, ticket_ref, Some(prior_id))
            .await?;
        tracing::info!(
            instance_id = %new_id,
            prior = prior_id,
            clean = report.is_clean(),
            "restarted workflow"
        );
        Ok(instance)
    }

    async fn create_and_start(
        &self,
        instance_id: &str,
        recipe: &Recipe,
        ticket_ref: Option<String>,
        restarted_from: Option<&str>,
    ) -> WorkflowResult<WorkflowInstance> {
        let new = NewInstance {
            id: instance_id.to_string(),
            recipe_name: recipe.name().to_string(),
            stages: recipe.stages().to_vec(),
            ticket_ref,
        };
        // The starting stage is assigned directly, never reached by advancing.
        let start = recipe.initial_position();
        let prior = restarted_from.map(str::to_string);
        let instance = self
            .inner
            .db
            .call(move |db| {
                let instance = db.create_instance(&new, start)?;
                db.record_activity(&new.id, ActivityType::Created, None, Some(start.as_str()))?;
                if let Some(prior) = &prior {
                    db.record_activity(
                        &new.id,
                        ActivityType::Restarted,
                        Some(prior),
                        Some(start.as_str()),
                    )?;
                }
                Ok(instance)
            })
            .await
            .map_err(db_err)?;

        tracing::info!(instance_id, recipe = %recipe, "instance created");
        self.publish(
            instance_id,
            EventCategory::StatusUpdate,
            Some(start),
            json!({
                "status": instance.status,
                "recipe": recipe.name(),
                "restarted_from": restarted_from,
            }),
        );
        self.spawn_run(instance_id);
        Ok(instance)
    }

    // ── Execution ─────────────────────────────────────────────────────

    fn spawn_run(&self, instance_id: &str) {
        let cancel = CancellationToken::new();
        let this = self.clone();
        let id = instance_id.to_string();
        let token = cancel.clone();
        let mut runs = lock(&self.inner.runs);
        let handle = tokio::spawn(async move { this.drive(id, token).await });
        runs.insert(instance_id.to_string(), RunHandle { cancel, handle });
    }

    /// Cancel an instance's driver task and wait for it to finish.
    async fn stop_run(&self, instance_id: &str) {
        let run = lock(&self.inner.runs).remove(instance_id);
        if let Some(run) = run {
            run.cancel.cancel();
            if let Err(e) = run.handle.await {
                tracing::warn!(instance_id, error = %e, "run task ended abnormally");
            }
        }
    }

    pub fn is_running(&self, instance_id: &str) -> bool {
        lock(&self.inner.runs).contains_key(instance_id)
    }

    async fn drive(self, instance_id: String, cancel: CancellationToken) {
        match self.drive_stages(&instance_id, &cancel).await {
            Ok(()) => {}
            Err(_) if cancel.is_cancelled() => {
                tracing::debug!(instance_id = %instance_id, "run cancelled");
            }
            Err(e) => self.fail(&instance_id, &e).await,
        }
        lock(&self.inner.runs).remove(&instance_id);
        self.prune_lock(&instance_id);
    }

    async fn drive_stages(
        &self,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> WorkflowResult<()> {
        let instance = self.get_live(instance_id).await?;
        let copy = self.inner.copies.provision(instance_id).await?;
        {
            let id = instance_id.to_string();
            let copy = copy.clone();
            self.inner
                .db
                .call(move |db| {
                    db.set_worktree(&id, &copy.branch, &copy.path)?;
                    db.record_activity(
                        &id,
                        ActivityType::WorktreeProvisioned,
                        None,
                        Some(&copy.path.to_string_lossy()),
                    )
                })
                .await
                .map_err(db_err)?;
        }
        if cancel.is_cancelled() {
            return Ok(());
        }

        let Some(runner) = self.inner.runner.clone() else {
            // Completion signals arrive through `advance` once the instance
            // is in progress, so the first tailer has to exist before that.
            if let Some(stage) = instance.current_stage.stage() {
                self.watch_stage(instance_id, stage).await;
            }
            self.transition(instance_id, InstanceStatus::InProgress, None)
                .await?;
            return Ok(());
        };
        self.transition(instance_id, InstanceStatus::InProgress, None)
            .await?;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let current = self.get_live(instance_id).await?;
            let Some(stage) = current.current_stage.stage() else {
                return Ok(());
            };
            self.watch_stage(instance_id, stage).await;

            let ctx = StageContext {
                instance_id: instance_id.to_string(),
                stage,
                recipe_name: current.recipe_name.clone(),
                worktree: copy.path.clone(),
                artifacts_dir: self.inner.copies.artifacts_dir(instance_id),
                ticket_ref: current.ticket_ref.clone(),
            };
            let outcome = runner.run(&ctx, cancel.clone()).await;
            self.inner.logs.release(instance_id, stage).await;
            let outcome = outcome.with_context(|| format!("stage {} of {}", stage, instance_id))?;

            if outcome.cancelled || cancel.is_cancelled() {
                return Ok(());
            }
            if !outcome.success {
                return Err(WorkflowError::Other(anyhow::anyhow!(
                    "stage {} failed: {}",
                    stage,
                    outcome.error.unwrap_or_else(|| "unknown error".to_string())
                )));
            }
            self.apply_completion(instance_id, stage).await?;
        }
    }

    async fn watch_stage(&self, instance_id: &str, stage: Stage) {
        if let Err(e) = self.inner.logs.acquire(instance_id, stage).await {
            tracing::warn!(instance_id, stage = %stage, error = %e, "could not start log tailer");
        }
    }

    async fn fail(&self, instance_id: &str, error: &WorkflowError) {
        tracing::error!(instance_id, error = %error, kind = error.kind(), "instance failed");
        self.inner.logs.release_instance(instance_id).await;
        if let Err(e) = self
            .transition(instance_id, InstanceStatus::Errored, Some(error.to_string()))
            .await
        {
            tracing::warn!(instance_id, error = %e, "could not mark instance errored");
        }
        self.publish(
            instance_id,
            EventCategory::Error,
            None,
            json!({ "kind": error.kind(), "message": error.to_string() }),
        );
    }

    /// Apply an external completion signal for `completed`. Moves the
    /// instance to the next stage of its own recipe, or to `ready_to_merge`
    /// and `completed` after the last one. Only accepted when stages are
    /// completed externally; with a built-in runner the runner owns every
    /// transition.
    pub async fn advance(
        &self,
        instance_id: &str,
        completed: Stage,
    ) -> WorkflowResult<WorkflowInstance> {
        if self.inner.runner.is_some() {
            return Err(WorkflowError::conflict(
                instance_id,
                "stages are completed by the built-in runner",
            ));
        }
        self.apply_completion(instance_id, completed).await
    }

    async fn apply_completion(
        &self,
        instance_id: &str,
        completed: Stage,
    ) -> WorkflowResult<WorkflowInstance> {
        let _guard = self.lock_instance(instance_id).await;
        let instance = self.get_live(instance_id).await?;
        if !instance.status.is_running() {
            return Err(WorkflowError::validation(
                Some(instance_id),
                format!("instance is {}, not running", instance.status),
            ));
        }
        let recipe = Recipe::from_stages(&instance.recipe_name, instance.stages.clone())
            .map_err(|e| e.for_instance(instance_id))?;
        let from = instance.current_stage;
        let next = stage_engine::advance(&recipe, from, completed)
            .map_err(|e| e.for_instance(instance_id))?;

        let id = instance_id.to_string();
        self.inner
            .db
            .call(move |db| {
                db.update_stage(&id, next)?;
                db.record_activity(
                    &id,
                    ActivityType::StageChanged,
                    Some(from.as_str()),
                    Some(next.as_str()),
                )
            })
            .await
            .map_err(db_err)?;
        tracing::info!(instance_id, from = %from, to = %next, "stage transition");
        self.publish(
            instance_id,
            EventCategory::StageTransition,
            Some(next),
            json!({ "from": from, "to": next }),
        );
        self.inner.logs.release(instance_id, completed).await;

        if instance.status == InstanceStatus::Stuck {
            self.transition(instance_id, InstanceStatus::InProgress, None)
                .await?;
        }
        match next {
            StagePosition::Terminal => {
                let done = self
                    .transition(instance_id, InstanceStatus::Completed, None)
                    .await?;
                self.publish(
                    instance_id,
                    EventCategory::Completion,
                    Some(StagePosition::Terminal),
                    json!({ "status": done.status, "recipe": done.recipe_name }),
                );
                Ok(done)
            }
            StagePosition::At(stage) => {
                if self.inner.runner.is_none() {
                    self.watch_stage(instance_id, stage).await;
                }
                self.get_live(instance_id).await
            }
        }
    }

    // ── Merge / delete ────────────────────────────────────────────────

    /// Integrate a completed instance into the local primary branch. The
    /// instance stays listed as `merged`.
    pub async fn merge(&self, instance_id: &str) -> WorkflowResult<WorkflowInstance> {
        let result = self.merge_locked(instance_id).await;
        self.prune_lock(instance_id);
        result
    }

    async fn merge_locked(&self, instance_id: &str) -> WorkflowResult<WorkflowInstance> {
        let _guard = self.lock_instance(instance_id).await;
        let instance = self.get_live(instance_id).await?;
        match instance.status {
            InstanceStatus::Completed => {}
            InstanceStatus::Merged => {
                return Err(WorkflowError::conflict(instance_id, "instance is already merged"));
            }
            other => {
                return Err(WorkflowError::validation(
                    Some(instance_id),
                    format!("only completed instances can be merged (status is {})", other),
                ));
            }
        }

        let commit = match self.inner.copies.integrate(instance_id).await {
            Ok(commit) => commit,
            Err(e) => {
                let e = e.for_instance(instance_id);
                tracing::warn!(instance_id, error = %e, "merge failed");
                self.publish(
                    instance_id,
                    EventCategory::Error,
                    Some(instance.current_stage),
                    json!({ "operation": "merge", "kind": e.kind(), "message": e.to_string() }),
                );
                return Err(e);
            }
        };

        let merged = self
            .transition(instance_id, InstanceStatus::Merged, None)
            .await?;
        self.record(instance_id, ActivityType::Merged, None, Some(commit.clone()))
            .await?;
        self.publish(
            instance_id,
            EventCategory::Completion,
            Some(merged.current_stage),
            json!({ "status": merged.status, "merged": true, "commit": commit }),
        );
        Ok(merged)
    }

    /// Cancel everything running for the instance, remove its working copy
    /// and artifacts, and tombstone the record. Cleanup legs that keep failing
    /// are queued for the janitor. Deleting an already-deleted instance
    /// re-runs the (idempotent) cleanup.
    pub async fn delete(&self, instance_id: &str) -> WorkflowResult<RemovalReport> {
        let Some(existing) = self.find(instance_id).await? else {
            return Err(WorkflowError::not_found(instance_id, "Instance"));
        };
        self.stop_run(instance_id).await;
        let guard = self.lock_instance(instance_id).await;

        if !existing.is_deleted() {
            self.publish(
                instance_id,
                EventCategory::StatusUpdate,
                Some(existing.current_stage),
                json!({ "deleted": true, "reason": "deleted" }),
            );
        }
        self.release_resources(instance_id).await;
        let report = self.remove_copy(instance_id).await?;
        self.tombstone(instance_id, "deleted").await?;
        drop(guard);
        self.prune_lock(instance_id);
        tracing::info!(instance_id, clean = report.is_clean(), "instance deleted");
        Ok(report)
    }

    /// Stop tailers, drop buffered logs and end instance-scoped subscriptions.
    async fn release_resources(&self, instance_id: &str) {
        self.inner.logs.forget(instance_id).await;
        self.inner.events.cancel_instance(instance_id);
    }

    async fn remove_copy(&self, instance_id: &str) -> WorkflowResult<RemovalReport> {
        let report = self.inner.copies.remove(instance_id).await?;
        let failures = report.failures();
        if failures.is_empty() {
            return Ok(report);
        }
        for (target, location, error) in &failures {
            tracing::warn!(
                instance_id,
                target = target.as_str(),
                location = %location,
                error = %error,
                "cleanup leg failed, queued for retry"
            );
        }
        let id = instance_id.to_string();
        self.inner
            .db
            .call(move |db| {
                for (target, location, error) in &failures {
                    db.enqueue_cleanup(&id, *target, location, error)?;
                }
                Ok(())
            })
            .await
            .map_err(db_err)?;
        Ok(report)
    }

    async fn tombstone(&self, instance_id: &str, reason: &'static str) -> WorkflowResult<()> {
        let id = instance_id.to_string();
        self.inner
            .db
            .call(move |db| {
                let previous = db.get_instance(&id)?.map(|i| i.status);
                if db.tombstone(&id, Some(reason))? {
                    db.record_activity(
                        &id,
                        ActivityType::Deleted,
                        previous.map(|s| s.as_str()),
                        Some(reason),
                    )?;
                }
                Ok(())
            })
            .await
            .map_err(db_err)
    }

    // ── Monitor hooks ─────────────────────────────────────────────────

    pub(crate) async fn mark_stuck(&self, instance_id: &str) -> WorkflowResult<WorkflowInstance> {
        let instance = self
            .transition(instance_id, InstanceStatus::Stuck, None)
            .await?;
        self.publish(
            instance_id,
            EventCategory::Error,
            Some(instance.current_stage),
            json!({
                "kind": "stuck",
                "message": format!(
                    "no activity for {}s",
                    self.inner.config.stuck_threshold.as_secs()
                ),
            }),
        );
        Ok(instance)
    }

    pub(crate) async fn mark_active(&self, instance_id: &str) -> WorkflowResult<WorkflowInstance> {
        let id = instance_id.to_string();
        self.inner
            .db
            .call(move |db| db.touch_activity(&id))
            .await
            .map_err(db_err)?;
        self.transition(instance_id, InstanceStatus::InProgress, None)
            .await
    }

    // ── Queries ───────────────────────────────────────────────────────

    /// Live instances; merged ones included, tombstones excluded.
    pub async fn list(&self, filter: InstanceFilter) -> WorkflowResult<Vec<WorkflowInstance>> {
        self.inner
            .db
            .call(move |db| db.list_instances(&filter))
            .await
            .map_err(db_err)
    }

    /// Detail view. Tombstoned instances are still returned for audit.
    pub async fn get(&self, instance_id: &str) -> WorkflowResult<InstanceDetail> {
        let instance = self
            .find(instance_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found(instance_id, "Instance"))?;
        let activity = self.activity(instance_id, Some(50)).await?;
        Ok(InstanceDetail {
            log_availability: self.inner.logs.availability(instance_id),
            instance,
            activity,
        })
    }

    pub async fn logs(
        &self,
        instance_id: &str,
        stage: Option<Stage>,
        since: Option<u64>,
        limit: Option<usize>,
    ) -> WorkflowResult<LogView> {
        if self.find(instance_id).await?.is_none() {
            return Err(WorkflowError::not_found(instance_id, "Instance"));
        }
        self.inner.logs.logs(instance_id, stage, since, limit).await
    }

    pub async fn activity(
        &self,
        instance_id: &str,
        limit: Option<usize>,
    ) -> WorkflowResult<Vec<ActivityLogEntry>> {
        let id = instance_id.to_string();
        self.inner
            .db
            .call(move |db| db.list_activity(&id, limit))
            .await
            .map_err(db_err)
    }

    /// Cancel every running instance and stop all tailers. Interrupted
    /// instances keep their status; the monitor flags them stuck if they are
    /// never resumed.
    pub async fn shutdown(&self) {
        let runs: Vec<(String, RunHandle)> = lock(&self.inner.runs).drain().collect();
        for (_, run) in &runs {
            run.cancel.cancel();
        }
        for (instance_id, run) in runs {
            if let Err(e) = run.handle.await {
                tracing::warn!(instance_id = %instance_id, error = %e, "run task ended abnormally");
            }
        }
        self.inner.logs.shutdown().await;
        tracing::info!("orchestrator stopped");
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::test_support::*;
    use super::*;
    use crate::workflow::broadcaster::{EventFilter, Subscription, SubscriptionEvent};

    async fn next_event(sub: &mut Subscription) -> Arc<PushMessage> {
        match tokio::time::timeout(Duration::from_secs(5), sub.recv()).await {
            Ok(Some(SubscriptionEvent::Message(msg))) => msg,
            other => panic!("expected event, got {:?}", other),
        }
    }

    async fn wait_for_category(
        sub: &mut Subscription,
        category: EventCategory,
    ) -> Arc<PushMessage> {
        loop {
            let msg = next_event(sub).await;
            if msg.category == category {
                return msg;
            }
        }
    }

    fn at(stage: Stage) -> StagePosition {
        StagePosition::At(stage)
    }

    #[tokio::test]
    async fn test_trigger_creates_instance_at_first_stage() {
        let h = harness(true);
        let created = h
            .orch
            .trigger(request("plan_build", Some("wf-1"), None))
            .await
            .unwrap();
        assert_eq!(created.id, "wf-1");
        assert_eq!(created.current_stage, at(Stage::Plan));
        assert_eq!(created.status, InstanceStatus::Pending);
        assert_eq!(created.stages, vec![Stage::Plan, Stage::Build]);

        let running = wait_for(&h.orch, "wf-1", |i| i.status == InstanceStatus::InProgress).await;
        assert_eq!(running.branch_name.as_deref(), Some("pipewright/wf-1"));
        assert!(h.copies.is_live("wf-1"));

        let kinds: Vec<ActivityType> = h
            .orch
            .activity("wf-1", None)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.event_type)
            .collect();
        assert_eq!(
            kinds,
            vec![
                ActivityType::Created,
                ActivityType::WorktreeProvisioned,
                ActivityType::StatusChanged
            ]
        );
        h.orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_trigger_without_id_allocates_one() {
        let h = harness(true);
        let created = h.orch.trigger(request("adw_plan_iso", None, None)).await.unwrap();
        assert!(validate_instance_id(&created.id).is_ok());
        assert_eq!(created.recipe_name, "adw_plan_iso");
        assert_eq!(created.stages, vec![Stage::Plan]);
        h.orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_follows_recipe_to_terminal() {
        let h = harness(true);
        let mut sub = h.orch.events().subscribe(EventFilter::all());
        h.runner.allow(2);
        h.orch
            .trigger(request("plan_build", Some("wf-1"), None))
            .await
            .unwrap();

        let done = wait_for(&h.orch, "wf-1", |i| i.status == InstanceStatus::Completed).await;
        assert_eq!(done.current_stage, StagePosition::Terminal);
        assert!(done.completed_at.is_some());
        assert_eq!(h.runner.stages_run("wf-1"), vec![Stage::Plan, Stage::Build]);

        let transition = wait_for_category(&mut sub, EventCategory::StageTransition).await;
        assert_eq!(transition.payload["from"], "plan");
        assert_eq!(transition.payload["to"], "build");
        let last = wait_for_category(&mut sub, EventCategory::StageTransition).await;
        assert_eq!(last.payload["to"], "ready_to_merge");
        let completion = wait_for_category(&mut sub, EventCategory::Completion).await;
        assert_eq!(completion.stage, Some(StagePosition::Terminal));
    }

    #[tokio::test]
    async fn test_run_streams_stage_logs() {
        let h = harness(true);
        h.orch
            .trigger(request("plan", Some("wf-1"), None))
            .await
            .unwrap();
        wait_for(&h.orch, "wf-1", |i| i.status == InstanceStatus::InProgress).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let view = h.orch.logs("wf-1", Some(Stage::Plan), None, None).await;
            if let Ok(view) = view
                && !view.entries.is_empty()
            {
                assert_eq!(view.entries[0].payload["text"], "working on plan");
                break;
            }
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        h.orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_stage_failure_marks_errored() {
        let h = harness(true);
        let mut sub = h.orch.events().subscribe(EventFilter::instance("wf-1"));
        *lock(&h.runner.fail_stage) = Some(Stage::Plan);
        h.runner.allow(1);
        h.orch
            .trigger(request("plan_build", Some("wf-1"), None))
            .await
            .unwrap();

        let failed = wait_for(&h.orch, "wf-1", |i| i.status == InstanceStatus::Errored).await;
        assert_eq!(failed.current_stage, at(Stage::Plan));
        assert!(failed.error.unwrap().contains("stage plan failed"));
        let err = wait_for_category(&mut sub, EventCategory::Error).await;
        assert!(err.payload["message"].as_str().unwrap().contains("agent exited"));
    }

    #[tokio::test]
    async fn test_external_advance_rejected_while_runner_owns_stage() {
        let h = harness(true);
        h.orch
            .trigger(request("plan_build", Some("wf-1"), None))
            .await
            .unwrap();
        wait_for(&h.orch, "wf-1", |i| i.status == InstanceStatus::InProgress).await;

        let err = h.orch.advance("wf-1", Stage::Plan).await.unwrap_err();
        assert!(matches!(err, WorkflowError::ResourceConflict { .. }));
        let still = h.orch.get("wf-1").await.unwrap().instance;
        assert_eq!(still.current_stage, at(Stage::Plan));

        h.runner.allow(2);
        let done = wait_for(&h.orch, "wf-1", |i| i.status == InstanceStatus::Completed).await;
        assert_eq!(done.current_stage, StagePosition::Terminal);
        assert_eq!(h.runner.stages_run("wf-1"), vec![Stage::Plan, Stage::Build]);
    }

    #[tokio::test]
    async fn test_trigger_validation_errors() {
        let h = harness(true);

        let err = h.orch.trigger(request("plan_deploy", Some("wf-1"), None)).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Validation { .. }));
        assert_eq!(err.instance_id(), Some("wf-1"));

        let err = h
            .orch
            .trigger(request("plan_build", Some("wf-1"), Some("test")))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation { .. }));
        assert!(err.to_string().contains("not part of recipe"));

        let err = h.orch.trigger(request("plan_build", Some("../x"), None)).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Validation { .. }));

        let err = h
            .orch
            .trigger(request("plan_build", None, Some("build")))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation { .. }));

        h.orch
            .trigger(request("plan_build", Some("wf-1"), Some("plan")))
            .await
            .unwrap();
        let err = h.orch.trigger(request("plan_build", Some("wf-1"), None)).await.unwrap_err();
        assert!(matches!(err, WorkflowError::ResourceConflict { .. }));
        h.orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_from_later_stage_starts_fresh_instance() {
        let h = harness(true);
        h.runner.allow(1);
        h.orch
            .trigger(request("plan_build_test", Some("wf-x"), None))
            .await
            .unwrap();
        let x = wait_for(&h.orch, "wf-x", |i| i.current_stage == at(Stage::Build)).await;
        let prior_path = x.worktree_path.clone().unwrap();
        assert!(prior_path.exists());

        let y = h
            .orch
            .trigger(request("plan_build_test", Some("wf-x"), Some("build")))
            .await
            .unwrap();

        assert!(!prior_path.exists());
        assert!(!h.copies.is_live("wf-x"));
        assert_ne!(y.id, "wf-x");
        assert_eq!(y.current_stage, at(Stage::Plan));
        let y_now = wait_for(&h.orch, &y.id, |i| i.status == InstanceStatus::InProgress).await;
        assert_eq!(y_now.current_stage, at(Stage::Plan));

        let old = h.orch.get("wf-x").await.unwrap().instance;
        assert!(old.is_deleted());
        assert_eq!(old.deleted_reason.as_deref(), Some("restarted"));

        let ids: Vec<String> = h
            .orch
            .list(InstanceFilter::default())
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec![y.id.clone()]);

        let restarted = h
            .orch
            .activity(&y.id, None)
            .await
            .unwrap()
            .into_iter()
            .find(|a| a.event_type == ActivityType::Restarted)
            .unwrap();
        assert_eq!(restarted.old_value.as_deref(), Some("wf-x"));
        assert_eq!(restarted.new_value.as_deref(), Some("plan"));
        h.orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_merge_keeps_instance_listed() {
        let h = harness(true);
        h.runner.allow(2);
        h.orch
            .trigger(request("plan_build", Some("wf-z"), None))
            .await
            .unwrap();
        wait_for(&h.orch, "wf-z", |i| i.status == InstanceStatus::Completed).await;

        let merged = h.orch.merge("wf-z").await.unwrap();
        assert_eq!(merged.status, InstanceStatus::Merged);
        assert_eq!(*lock(&h.copies.merged), vec!["wf-z".to_string()]);
        assert_eq!(h.orch.tracked_locks(), 0);

        let listed = h.orch.list(InstanceFilter::default()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "wf-z");
        assert_eq!(listed[0].status, InstanceStatus::Merged);

        let activity = h.orch.activity("wf-z", None).await.unwrap();
        let merge = activity
            .iter()
            .find(|a| a.event_type == ActivityType::Merged)
            .unwrap();
        assert_eq!(merge.new_value.as_deref(), Some("0123456789abcdef"));

        let err = h.orch.merge("wf-z").await.unwrap_err();
        assert!(matches!(err, WorkflowError::ResourceConflict { .. }));
    }

    #[tokio::test]
    async fn test_merge_conflict_surfaces_integration_error() {
        let h = harness(true);
        let mut sub = h.orch.events().subscribe(EventFilter::instance("wf-z"));
        h.copies.merge_conflict.store(true, Ordering::SeqCst);
        h.runner.allow(1);
        h.orch
            .trigger(request("plan", Some("wf-z"), None))
            .await
            .unwrap();
        wait_for(&h.orch, "wf-z", |i| i.status == InstanceStatus::Completed).await;

        let err = h.orch.merge("wf-z").await.unwrap_err();
        assert!(matches!(err, WorkflowError::Integration { .. }));
        assert_eq!(err.instance_id(), Some("wf-z"));
        let still = h.orch.get("wf-z").await.unwrap().instance;
        assert_eq!(still.status, InstanceStatus::Completed);

        let event = wait_for_category(&mut sub, EventCategory::Error).await;
        assert_eq!(event.payload["kind"], "integration");
    }

    #[tokio::test]
    async fn test_merge_requires_completed() {
        let h = harness(true);
        h.orch
            .trigger(request("plan", Some("wf-1"), None))
            .await
            .unwrap();
        let err = h.orch.merge("wf-1").await.unwrap_err();
        assert!(matches!(err, WorkflowError::Validation { .. }));
        let err = h.orch.merge("nope").await.unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound { .. }));
        h.orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_delete_cascades_and_is_idempotent() {
        let h = harness(true);
        h.orch
            .trigger(request("plan_build", Some("wf-d"), None))
            .await
            .unwrap();
        let running = wait_for(&h.orch, "wf-d", |i| i.status == InstanceStatus::InProgress).await;
        let path = running.worktree_path.unwrap();
        let mut sub = h.orch.events().subscribe(EventFilter::instance("wf-d"));

        let report = h.orch.delete("wf-d").await.unwrap();
        assert!(report.is_clean());
        assert!(!path.exists());
        assert!(!h.orch.is_running("wf-d"));
        assert!(h.orch.log_aggregator().active_tailers().is_empty());
        assert!(tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .is_none());

        assert!(h.orch.list(InstanceFilter::default()).await.unwrap().is_empty());
        let tombstone = h.orch.get("wf-d").await.unwrap().instance;
        assert_eq!(tombstone.deleted_reason.as_deref(), Some("deleted"));

        let again = h.orch.delete("wf-d").await.unwrap();
        assert!(again.is_clean());
        assert_eq!(h.orch.tracked_locks(), 0);
        let err = h.orch.delete("missing").await.unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_queues_failed_cleanup_legs() {
        let h = harness(true);
        h.copies.fail_branch_removal.store(true, Ordering::SeqCst);
        h.orch
            .trigger(request("plan", Some("wf-d"), None))
            .await
            .unwrap();
        wait_for(&h.orch, "wf-d", |i| i.status == InstanceStatus::InProgress).await;

        let report = h.orch.delete("wf-d").await.unwrap();
        assert!(!report.is_clean());
        let queued = h.orch.db().call(|db| db.all_cleanups()).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].target, CleanupTarget::Branch);
        assert_eq!(queued[0].location, "pipewright/wf-d");
        assert!(h.orch.get("wf-d").await.unwrap().instance.is_deleted());
    }

    #[tokio::test]
    async fn test_external_completion_signals() {
        let h = harness(false);
        h.orch
            .trigger(request("plan_build", Some("wf-e"), None))
            .await
            .unwrap();
        wait_for(&h.orch, "wf-e", |i| i.status == InstanceStatus::InProgress).await;

        let err = h.orch.advance("wf-e", Stage::Build).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Validation { .. }));

        let next = h.orch.advance("wf-e", Stage::Plan).await.unwrap();
        assert_eq!(next.current_stage, at(Stage::Build));
        assert_eq!(
            h.orch.log_aggregator().active_tailers(),
            vec![("wf-e".to_string(), Stage::Build)]
        );

        let err = h.orch.advance("wf-e", Stage::Test).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Validation { .. }));
        assert_eq!(err.instance_id(), Some("wf-e"));

        let done = h.orch.advance("wf-e", Stage::Build).await.unwrap();
        assert_eq!(done.current_stage, StagePosition::Terminal);
        assert_eq!(done.status, InstanceStatus::Completed);
        assert!(h.orch.log_aggregator().active_tailers().is_empty());

        let err = h.orch.advance("wf-e", Stage::Build).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_runs() {
        let h = harness(true);
        h.orch
            .trigger(request("plan", Some("wf-s"), None))
            .await
            .unwrap();
        wait_for(&h.orch, "wf-s", |i| i.status == InstanceStatus::InProgress).await;
        assert!(h.orch.is_running("wf-s"));

        h.orch.shutdown().await;
        assert!(!h.orch.is_running("wf-s"));
        let after = h.orch.get("wf-s").await.unwrap().instance;
        assert_eq!(after.status, InstanceStatus::InProgress);
    }

    #[tokio::test]
    async fn test_merge_integrates_into_local_primary_with_git() {
        use crate::workflow::db::StateDb;
        use crate::workflow::worktree::test_support::{git_available, init_repo, run_git};
        use crate::workflow::worktree::{GitWorktreeManager, LegRetry};

        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let config = test_config(dir.path());
        let copies = Arc::new(GitWorktreeManager::new(&config).with_retry(LegRetry {
            attempts: 1,
            base_delay: Duration::from_millis(1),
        }));
        let db = DbHandle::new(StateDb::new_in_memory().unwrap());
        let orch = Orchestrator::new(config, db, copies, None);

        orch.trigger(request("build", Some("wf-g"), None)).await.unwrap();
        let running = wait_for(&orch, "wf-g", |i| i.status == InstanceStatus::InProgress).await;
        let worktree = running.worktree_path.unwrap();
        std::fs::write(worktree.join("feature.txt"), "new\n").unwrap();
        run_git(&worktree, &["add", "feature.txt"]);
        run_git(&worktree, &["commit", "-q", "-m", "add feature"]);

        orch.advance("wf-g", Stage::Build).await.unwrap();
        let merged = orch.merge("wf-g").await.unwrap();
        assert_eq!(merged.status, InstanceStatus::Merged);
        assert!(dir.path().join("feature.txt").exists());
        let listed = orch.list(InstanceFilter::default()).await.unwrap();
        assert_eq!(listed[0].id, "wf-g");
        orch.shutdown().await;
    }
}
