//! Background sweeps: stuck detection and the cleanup janitor.

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::models::{InstanceFilter, InstanceStatus};
use super::orchestrator::Orchestrator;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StuckSweep {
    pub flagged: Vec<String>,
    pub recovered: Vec<String>,
    /// Stale in the database but with fresher log output; clock reset only.
    pub refreshed: Vec<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupSweep {
    pub resolved: usize,
    pub failed: usize,
}

pub struct Monitor {
    orch: Orchestrator,
}

impl Monitor {
    pub fn new(orch: Orchestrator) -> Self {
        Self { orch }
    }

    /// Flag in-progress instances with no output for longer than the stuck
    /// threshold, and clear the flag on stuck instances that produced output
    /// since they were flagged.
    pub async fn sweep_stuck(&self) -> Result<StuckSweep> {
        let threshold = ChronoDuration::from_std(self.orch.config().stuck_threshold)
            .context("stuck threshold out of range")?;
        let cutoff = Utc::now() - threshold;
        let logs = self.orch.log_aggregator();
        let mut sweep = StuckSweep::default();

        let stale = self
            .orch
            .db()
            .call(move |db| db.stale_running(cutoff))
            .await?;
        for instance in stale {
            if logs.last_activity(&instance.id).is_some_and(|t| t > cutoff) {
                let id = instance.id.clone();
                self.orch.db().call(move |db| db.touch_activity(&id)).await?;
                sweep.refreshed.push(instance.id);
                continue;
            }
            match self.orch.mark_stuck(&instance.id).await {
                Ok(_) => {
                    tracing::warn!(instance_id = %instance.id, stage = %instance.current_stage, "instance flagged stuck");
                    sweep.flagged.push(instance.id);
                }
                Err(e) => {
                    tracing::debug!(instance_id = %instance.id, error = %e, "skipped stuck flag");
                }
            }
        }

        let stuck = self
            .orch
            .db()
            .call(|db| {
                db.list_instances(&InstanceFilter {
                    status: Some(InstanceStatus::Stuck),
                    stage: None,
                })
            })
            .await?;
        for instance in stuck {
            let resumed = logs
                .last_activity(&instance.id)
                .is_some_and(|t| t > instance.last_activity_at);
            if !resumed {
                continue;
            }
            match self.orch.mark_active(&instance.id).await {
                Ok(_) => {
                    tracing::info!(instance_id = %instance.id, "stuck instance resumed");
                    sweep.recovered.push(instance.id);
                }
                Err(e) => {
                    tracing::debug!(instance_id = %instance.id, error = %e, "skipped stuck recovery");
                }
            }
        }
        Ok(sweep)
    }

    /// Retry queued cleanup legs. Entries that reach the attempt limit stay in
    /// the table for inspection but are no longer retried.
    pub async fn sweep_cleanups(&self) -> Result<CleanupSweep> {
        let max = self.orch.config().cleanup_max_attempts;
        let pending = self
            .orch
            .db()
            .call(move |db| db.list_cleanups(max))
            .await?;
        let copies = self.orch.working_copies();
        let mut sweep = CleanupSweep::default();

        for cleanup in pending {
            match copies.retry_cleanup(cleanup.target, &cleanup.location).await {
                Ok(()) => {
                    self.orch
                        .db()
                        .call(move |db| db.resolve_cleanup(cleanup.id))
                        .await?;
                    tracing::info!(
                        instance_id = %cleanup.instance_id,
                        target = cleanup.target.as_str(),
                        "queued cleanup resolved"
                    );
                    sweep.resolved += 1;
                }
                Err(e) => {
                    let message = format!("{:#}", e);
                    let attempts = cleanup.attempts + 1;
                    if attempts >= max {
                        tracing::error!(
                            instance_id = %cleanup.instance_id,
                            target = cleanup.target.as_str(),
                            location = %cleanup.location,
                            error = %message,
                            "cleanup gave up after {} attempts",
                            attempts
                        );
                    } else {
                        tracing::warn!(
                            instance_id = %cleanup.instance_id,
                            target = cleanup.target.as_str(),
                            error = %message,
                            attempts,
                            "cleanup retry failed"
                        );
                    }
                    self.orch
                        .db()
                        .call(move |db| db.bump_cleanup(cleanup.id, &message))
                        .await?;
                    sweep.failed += 1;
                }
            }
        }
        Ok(sweep)
    }

    pub async fn tick(&self) {
        if let Err(e) = self.sweep_stuck().await {
            tracing::warn!(error = %e, "stuck sweep failed");
        }
        if let Err(e) = self.sweep_cleanups().await {
            tracing::warn!(error = %e, "cleanup sweep failed");
        }
    }

    /// Run both sweeps every `monitor_interval` until cancelled.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        let period = self.orch.config().monitor_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => self.tick().await,
                }
            }
            tracing::debug!("monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::workflow::logs::tailer::STREAM_FILE;
    use crate::workflow::models::{CleanupTarget, Stage};
    use crate::workflow::orchestrator::test_support::*;
    use crate::workflow::worktree::WorkingCopies;

    #[tokio::test]
    async fn test_quiet_instance_is_flagged_then_recovers_on_output() {
        let h = harness_with(false, |c| c.stuck_threshold = Duration::ZERO);
        h.orch
            .trigger(request("plan_build", Some("wf-q"), None))
            .await
            .unwrap();
        wait_for(&h.orch, "wf-q", |i| i.status == InstanceStatus::InProgress).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let monitor = Monitor::new(h.orch.clone());
        let sweep = monitor.sweep_stuck().await.unwrap();
        assert_eq!(sweep.flagged, vec!["wf-q".to_string()]);
        let stuck = h.orch.get("wf-q").await.unwrap().instance;
        assert_eq!(stuck.status, InstanceStatus::Stuck);

        // Flagging is idempotent while nothing happens.
        let again = monitor.sweep_stuck().await.unwrap();
        assert!(again.flagged.is_empty());
        assert!(again.recovered.is_empty());

        let stage_dir = h.copies.artifacts_dir("wf-q").join("plan_abc123");
        std::fs::create_dir_all(&stage_dir).unwrap();
        std::fs::write(
            stage_dir.join(STREAM_FILE),
            "{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"back\"}]}}\n",
        )
        .unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while h.orch.log_aggregator().last_activity("wf-q").is_none() {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let sweep = monitor.sweep_stuck().await.unwrap();
        assert_eq!(sweep.recovered, vec!["wf-q".to_string()]);
        let resumed = h.orch.get("wf-q").await.unwrap().instance;
        assert_eq!(resumed.status, InstanceStatus::InProgress);
        h.orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_active_instance_is_not_flagged() {
        let h = harness(false);
        h.orch
            .trigger(request("plan", Some("wf-a"), None))
            .await
            .unwrap();
        wait_for(&h.orch, "wf-a", |i| i.status == InstanceStatus::InProgress).await;

        let sweep = Monitor::new(h.orch.clone()).sweep_stuck().await.unwrap();
        assert_eq!(sweep, StuckSweep::default());
        h.orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_stuck_instance_still_accepts_completion() {
        let h = harness_with(false, |c| c.stuck_threshold = Duration::ZERO);
        h.orch
            .trigger(request("plan", Some("wf-s"), None))
            .await
            .unwrap();
        wait_for(&h.orch, "wf-s", |i| i.status == InstanceStatus::InProgress).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        Monitor::new(h.orch.clone()).sweep_stuck().await.unwrap();

        let done = h.orch.advance("wf-s", Stage::Plan).await.unwrap();
        assert_eq!(done.status, InstanceStatus::Completed);
    }

    #[tokio::test]
    async fn test_janitor_resolves_queued_cleanup() {
        let h = harness(true);
        h.orch
            .db()
            .call(|db| db.enqueue_cleanup("wf-old", CleanupTarget::Branch, "pipewright/wf-old", "locked"))
            .await
            .unwrap();

        let sweep = Monitor::new(h.orch.clone()).sweep_cleanups().await.unwrap();
        assert_eq!(sweep, CleanupSweep { resolved: 1, failed: 0 });
        assert_eq!(
            *h.copies.retried.lock().unwrap(),
            vec![(CleanupTarget::Branch, "pipewright/wf-old".to_string())]
        );
        assert!(h.orch.db().call(|db| db.all_cleanups()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_janitor_stops_after_max_attempts() {
        let h = harness_with(true, |c| c.cleanup_max_attempts = 2);
        h.copies.fail_retries.store(true, Ordering::SeqCst);
        h.orch
            .db()
            .call(|db| db.enqueue_cleanup("wf-old", CleanupTarget::Worktree, "/tmp/wt", "busy"))
            .await
            .unwrap();
        let monitor = Monitor::new(h.orch.clone());

        let first = monitor.sweep_cleanups().await.unwrap();
        assert_eq!(first, CleanupSweep { resolved: 0, failed: 1 });
        let second = monitor.sweep_cleanups().await.unwrap();
        assert_eq!(second, CleanupSweep::default());

        let queued = h.orch.db().call(|db| db.all_cleanups()).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].attempts, 2);
        assert_eq!(queued[0].last_error.as_deref(), Some("still locked"));
        assert_eq!(h.copies.retried.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_spawned_monitor_stops_on_cancel() {
        let h = harness_with(true, |c| c.monitor_interval = Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let handle = Monitor::new(h.orch.clone()).spawn(cancel.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
