//! Log aggregation: turns each stage's `raw_output.jsonl` into a bounded,
//! sequenced, per-instance history and fans new entries out to subscribers.
//!
//! - `parser` - one JSON line to zero or more typed entries
//! - `tailer` - incremental reader for one stage's log file
//! - `buffer` - bounded per-instance ring of entries

pub mod buffer;
pub mod parser;
pub mod tailer;

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pipewright_common::PushMessage;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use self::buffer::LogBuffer;
use self::parser::ParsedEntry;
use self::tailer::{StageTail, find_stage_dir, read_summary};
use crate::config::RuntimeConfig;
use crate::errors::{WorkflowError, WorkflowResult};
use crate::workflow::broadcaster::{EventBroadcaster, EventFilter, EventSource, Subscription};
use crate::workflow::models::{
    LogAvailability, LogCategory, LogView, Stage, StageLogEntry, StagePosition,
};

const MAX_READ_BACKOFF: Duration = Duration::from_secs(10);

/// Convert a buffered entry to the message pushed for it.
pub fn entry_message(entry: &StageLogEntry) -> PushMessage {
    let mut msg = PushMessage::new(
        entry.instance_id.clone(),
        entry.category.into(),
        Some(StagePosition::At(entry.stage)),
        entry.payload.clone(),
    )
    .with_seq(entry.seq);
    msg.timestamp = entry.timestamp;
    msg
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct InstanceLogs {
    buffer: LogBuffer,
    /// Byte offset consumed per stage file.
    cursors: HashMap<Stage, u64>,
    summarized: HashSet<Stage>,
    degraded: bool,
}

struct InstanceState {
    /// Held for the whole backfill so tailers never start from a stale cursor.
    fetch: tokio::sync::Mutex<()>,
    logs: Mutex<InstanceLogs>,
}

struct Tailer {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    artifacts_root: PathBuf,
    capacity: usize,
    poll_interval: Duration,
    broadcaster: EventBroadcaster,
    instances: Mutex<HashMap<String, Arc<InstanceState>>>,
    tailers: Mutex<HashMap<(String, Stage), Tailer>>,
}

impl Inner {
    fn instance_dir(&self, instance_id: &str) -> PathBuf {
        self.artifacts_root.join(instance_id)
    }

    /// Append parsed entries to the buffer and publish each one. Publishing
    /// happens under the buffer lock so subscribers see sequences in order.
    fn record(
        &self,
        state: &InstanceState,
        stage: Stage,
        entries: Vec<ParsedEntry>,
        offset: Option<u64>,
    ) {
        let mut logs = lock(&state.logs);
        for entry in entries {
            let stored = logs.buffer.push(stage, entry.category, entry.payload);
            self.broadcaster.publish(entry_message(&stored));
        }
        if let Some(offset) = offset {
            logs.cursors.insert(stage, offset);
        }
    }

    fn record_summary(&self, state: &InstanceState, stage: Stage, summary: Value) {
        let mut logs = lock(&state.logs);
        if !logs.summarized.insert(stage) {
            return;
        }
        let stored = logs.buffer.push(
            stage,
            LogCategory::Status,
            json!({ "event": "summary", "summary": summary }),
        );
        self.broadcaster.publish(entry_message(&stored));
    }

    fn set_degraded(&self, state: &InstanceState, degraded: bool) {
        lock(&state.logs).degraded = degraded;
    }
}

/// Owns every instance's log buffer and the background tailers feeding them.
#[derive(Clone)]
pub struct LogAggregator {
    inner: Arc<Inner>,
}

impl LogAggregator {
    pub fn new(
        artifacts_root: impl Into<PathBuf>,
        capacity: usize,
        poll_interval: Duration,
        broadcaster: EventBroadcaster,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                artifacts_root: artifacts_root.into(),
                capacity,
                poll_interval,
                broadcaster,
                instances: Mutex::new(HashMap::new()),
                tailers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn from_config(config: &RuntimeConfig, broadcaster: EventBroadcaster) -> Self {
        Self::new(
            config.artifacts_root.clone(),
            config.log_buffer_capacity,
            config.tail_poll_interval,
            broadcaster,
        )
    }

    pub fn broadcaster(&self) -> &EventBroadcaster {
        &self.inner.broadcaster
    }

    fn state(&self, instance_id: &str) -> Arc<InstanceState> {
        lock(&self.inner.instances)
            .entry(instance_id.to_string())
            .or_insert_with(|| {
                Arc::new(InstanceState {
                    fetch: tokio::sync::Mutex::new(()),
                    logs: Mutex::new(InstanceLogs {
                        buffer: LogBuffer::new(instance_id, self.inner.capacity),
                        cursors: HashMap::new(),
                        summarized: HashSet::new(),
                        degraded: false,
                    }),
                })
            })
            .clone()
    }

    fn existing_state(&self, instance_id: &str) -> Option<Arc<InstanceState>> {
        lock(&self.inner.instances).get(instance_id).cloned()
    }

    /// Load whatever is already on disk for the instance, once.
    async fn ensure_fetched(
        &self,
        instance_id: &str,
        state: &InstanceState,
    ) -> Result<(), (PathBuf, io::Error)> {
        if lock(&state.logs).buffer.is_fetched() {
            return Ok(());
        }
        let _fetching = state.fetch.lock().await;
        if !lock(&state.logs).buffer.begin_fetch() {
            return Ok(());
        }

        let instance_dir = self.inner.instance_dir(instance_id);
        let mut loaded = Vec::new();
        for stage in Stage::ALL {
            let mut tail = StageTail::new(&instance_dir, stage);
            let entries = match tail.poll().await {
                Ok(entries) => entries,
                Err(e) => {
                    let path = tail.stage_dir().unwrap_or(instance_dir.as_path()).to_path_buf();
                    let mut logs = lock(&state.logs);
                    logs.buffer.abort_fetch();
                    logs.degraded = true;
                    return Err((path, e));
                }
            };
            let Some(stage_dir) = tail.stage_dir() else {
                continue;
            };
            let summary = read_summary(stage_dir).await.unwrap_or_else(|e| {
                tracing::warn!(instance_id, stage = %stage, error = %e, "could not read stage summary");
                None
            });
            loaded.push((stage, entries, tail.offset(), summary));
        }

        let mut logs = lock(&state.logs);
        let mut count = 0;
        for (stage, entries, offset, summary) in loaded {
            count += entries.len();
            for entry in entries {
                logs.buffer.push(stage, entry.category, entry.payload);
            }
            if let Some(summary) = summary {
                logs.summarized.insert(stage);
                logs.buffer.push(
                    stage,
                    LogCategory::Status,
                    json!({ "event": "summary", "summary": summary }),
                );
            }
            logs.cursors.insert(stage, offset);
        }
        logs.buffer.finish_fetch();
        logs.degraded = false;
        tracing::debug!(instance_id, entries = count, "log history loaded");
        Ok(())
    }

    /// Start tailing `stage` for `instance_id`. At most one tailer exists per
    /// (instance, stage); a second acquire is a conflict.
    pub async fn acquire(&self, instance_id: &str, stage: Stage) -> WorkflowResult<()> {
        let key = (instance_id.to_string(), stage);
        if lock(&self.inner.tailers).contains_key(&key) {
            return Err(WorkflowError::conflict(
                instance_id,
                format!("a log tailer for stage {} is already running", stage),
            ));
        }

        let state = self.state(instance_id);
        self.ensure_fetched(instance_id, &state)
            .await
            .map_err(|(path, source)| WorkflowError::TransientIo {
                instance_id: Some(instance_id.to_string()),
                path,
                source,
            })?;
        let offset = lock(&state.logs).cursors.get(&stage).copied().unwrap_or(0);

        let mut tailers = lock(&self.inner.tailers);
        if tailers.contains_key(&key) {
            return Err(WorkflowError::conflict(
                instance_id,
                format!("a log tailer for stage {} is already running", stage),
            ));
        }
        let cancel = CancellationToken::new();
        let tail = StageTail::resume_at(self.inner.instance_dir(instance_id), stage, offset);
        let handle = tokio::spawn(run_tailer(
            self.inner.clone(),
            state,
            tail,
            cancel.clone(),
        ));
        tailers.insert(key, Tailer { cancel, handle });
        tracing::debug!(instance_id, stage = %stage, offset, "log tailer started");
        Ok(())
    }

    /// Stop the tailer for (instance, stage) after a final drain. Idempotent.
    pub async fn release(&self, instance_id: &str, stage: Stage) {
        let tailer = lock(&self.inner.tailers).remove(&(instance_id.to_string(), stage));
        let Some(tailer) = tailer else {
            return;
        };
        tailer.cancel.cancel();
        if let Err(e) = tailer.handle.await {
            tracing::warn!(instance_id, stage = %stage, error = %e, "log tailer ended abnormally");
        }
        tracing::debug!(instance_id, stage = %stage, "log tailer released");
    }

    pub async fn release_instance(&self, instance_id: &str) {
        let stages: Vec<Stage> = lock(&self.inner.tailers)
            .keys()
            .filter(|(id, _)| id == instance_id)
            .map(|(_, stage)| *stage)
            .collect();
        for stage in stages {
            self.release(instance_id, stage).await;
        }
    }

    /// Stop tailers and drop the buffered history for an instance.
    pub async fn forget(&self, instance_id: &str) {
        self.release_instance(instance_id).await;
        lock(&self.inner.instances).remove(instance_id);
    }

    pub async fn shutdown(&self) {
        let keys: Vec<(String, Stage)> = lock(&self.inner.tailers).keys().cloned().collect();
        for (id, stage) in keys {
            self.release(&id, stage).await;
        }
    }

    pub fn active_tailers(&self) -> Vec<(String, Stage)> {
        let mut keys: Vec<_> = lock(&self.inner.tailers).keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Buffered history for an instance, loading it from disk on first use.
    ///
    /// Asking for a stage that has neither an artifact folder nor buffered
    /// entries is `NotFound`. A read failure during the first load leaves the
    /// view `NotFetched` and `degraded` rather than failing the query.
    pub async fn logs(
        &self,
        instance_id: &str,
        stage: Option<Stage>,
        since: Option<u64>,
        limit: Option<usize>,
    ) -> WorkflowResult<LogView> {
        let state = self.state(instance_id);
        if let Err((path, e)) = self.ensure_fetched(instance_id, &state).await {
            tracing::warn!(instance_id, path = %path.display(), error = %e, "log history unavailable, will retry");
        }

        if let Some(stage) = stage
            && !lock(&state.logs).buffer.has_stage(stage)
            && find_stage_dir(&self.inner.instance_dir(instance_id), stage).is_none()
        {
            return Err(WorkflowError::not_found(
                instance_id,
                format!("Logs for stage {}", stage),
            ));
        }

        let logs = lock(&state.logs);
        Ok(LogView {
            instance_id: instance_id.to_string(),
            availability: logs.buffer.availability(),
            degraded: logs.degraded,
            entries: logs.buffer.query(stage, since, limit),
        })
    }

    pub fn availability(&self, instance_id: &str) -> LogAvailability {
        self.existing_state(instance_id)
            .map(|s| lock(&s.logs).buffer.availability())
            .unwrap_or(LogAvailability::NotFetched)
    }

    /// Timestamp of the newest buffered entry.
    pub fn last_activity(&self, instance_id: &str) -> Option<DateTime<Utc>> {
        self.existing_state(instance_id)
            .and_then(|s| lock(&s.logs).buffer.last_timestamp())
    }

    pub fn last_seq(&self, instance_id: &str) -> u64 {
        self.existing_state(instance_id)
            .map(|s| lock(&s.logs).buffer.last_seq())
            .unwrap_or(0)
    }
}

async fn run_tailer(
    inner: Arc<Inner>,
    state: Arc<InstanceState>,
    mut tail: StageTail,
    cancel: CancellationToken,
) {
    let stage = tail.stage();
    let mut delay = inner.poll_interval;
    loop {
        match tail.poll().await {
            Ok(entries) => {
                if !entries.is_empty() {
                    inner.record(&state, stage, entries, Some(tail.offset()));
                }
                if delay != inner.poll_interval {
                    tracing::info!(stage = %stage, "log reads recovered");
                    inner.set_degraded(&state, false);
                    delay = inner.poll_interval;
                }
            }
            Err(e) => {
                delay = (delay * 2).min(MAX_READ_BACKOFF);
                tracing::warn!(
                    stage = %stage,
                    error = %e,
                    retry_ms = delay.as_millis() as u64,
                    "log read failed, backing off"
                );
                inner.set_degraded(&state, true);
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    // Pick up whatever the agent wrote between the last tick and release.
    match tail.poll().await {
        Ok(entries) if !entries.is_empty() => {
            inner.record(&state, stage, entries, Some(tail.offset()));
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(stage = %stage, error = %e, "final log drain failed"),
    }
    if let Some(dir) = tail.stage_dir()
        && let Ok(Some(summary)) = read_summary(dir).await
    {
        inner.record_summary(&state, stage, summary);
    }
}

#[async_trait]
impl EventSource for LogAggregator {
    async fn subscribe(&self, filter: EventFilter) -> Result<Subscription> {
        Ok(self.inner.broadcaster.subscribe(filter))
    }

    async fn history(&self, instance_id: &str, since: u64) -> Result<Vec<PushMessage>> {
        let view = self.logs(instance_id, None, Some(since), None).await?;
        Ok(view.entries.iter().map(entry_message).collect())
    }
}
