//! Stage execution.
//!
//! A [`StageRunner`] runs one stage of one instance to completion. The
//! production runner spawns the Claude CLI inside the instance's worktree and
//! appends every stdout line to the stage's `raw_output.jsonl`, which the log
//! aggregator tails independently. When the process ends a summary is written
//! next to it as `raw_output.json`.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::logs::tailer::{STREAM_FILE, SUMMARY_FILE};
use super::models::Stage;
use crate::config::RuntimeConfig;

/// Everything a runner needs to execute one stage.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub instance_id: String,
    pub stage: Stage,
    pub recipe_name: String,
    pub worktree: PathBuf,
    /// Per-instance artifact root; the runner creates its stage folder inside.
    pub artifacts_dir: PathBuf,
    pub ticket_ref: Option<String>,
}

impl StageContext {
    /// Instruction handed to the agent for this stage.
    pub fn prompt(&self) -> String {
        let ticket = self
            .ticket_ref
            .as_deref()
            .map(|t| format!(" for ticket {}", t))
            .unwrap_or_default();
        let task = match self.stage {
            Stage::Clarify => "Clarify the requirements and record open questions",
            Stage::Plan => "Write an implementation plan",
            Stage::Build => "Implement the plan",
            Stage::Test => "Run the test suite and fix any failures",
            Stage::Review => "Review the changes on this branch against the plan",
            Stage::Document => "Update the documentation for the changes on this branch",
        };
        format!(
            "/{} {}{} (workflow {}, recipe {}). Work only inside the current directory.",
            self.stage, task, ticket, self.instance_id, self.recipe_name
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageOutcome {
    pub stage: Stage,
    pub stage_dir: PathBuf,
    pub exit_code: Option<i32>,
    pub success: bool,
    pub cancelled: bool,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[async_trait]
pub trait StageRunner: Send + Sync {
    /// Run `ctx.stage` to completion. Cancellation ends the run early with
    /// `cancelled = true`; only infrastructure failures are `Err`.
    async fn run(&self, ctx: &StageContext, cancel: CancellationToken) -> Result<StageOutcome>;
}

enum Ended {
    Exited,
    Cancelled,
    TimedOut,
}

/// Runs each stage as a `claude --print --output-format stream-json` process.
pub struct ClaudeStageRunner {
    claude_cmd: String,
    skip_permissions: bool,
    timeout: Duration,
}

impl ClaudeStageRunner {
    pub fn new(claude_cmd: impl Into<String>, skip_permissions: bool, timeout: Duration) -> Self {
        Self {
            claude_cmd: claude_cmd.into(),
            skip_permissions,
            timeout,
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(
            config.claude_cmd.clone(),
            config.skip_permissions,
            config.stage_timeout,
        )
    }

    fn command(&self, ctx: &StageContext) -> Command {
        let mut cmd = Command::new(&self.claude_cmd);
        cmd.args(["--print", "--output-format", "stream-json", "--verbose"]);
        if self.skip_permissions {
            cmd.arg("--dangerously-skip-permissions");
        }
        cmd.args(["-p", &ctx.prompt()])
            .current_dir(&ctx.worktree)
            .env("PIPEWRIGHT_INSTANCE_ID", &ctx.instance_id)
            .env("PIPEWRIGHT_STAGE", ctx.stage.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// The message of a `{"type":"result","is_error":true}` line, if `line` is one.
fn result_error(line: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(line).ok()?;
    if value.get("type")?.as_str()? != "result" || !value.get("is_error")?.as_bool()? {
        return None;
    }
    let message = value
        .get("result")
        .and_then(|r| r.as_str())
        .or_else(|| value.get("subtype").and_then(|s| s.as_str()))
        .unwrap_or("unknown error");
    Some(message.to_string())
}

fn stage_dir_name(stage: Stage) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", stage, &suffix[..6])
}

#[async_trait]
impl StageRunner for ClaudeStageRunner {
    async fn run(&self, ctx: &StageContext, cancel: CancellationToken) -> Result<StageOutcome> {
        let stage_dir = ctx.artifacts_dir.join(stage_dir_name(ctx.stage));
        tokio::fs::create_dir_all(&stage_dir)
            .await
            .with_context(|| format!("Failed to create {}", stage_dir.display()))?;
        let log_path = stage_dir.join(STREAM_FILE);
        let mut log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
            .with_context(|| format!("Failed to open {}", log_path.display()))?;

        let started = Instant::now();
        let mut child = self
            .command(ctx)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.claude_cmd))?;
        tracing::info!(
            instance_id = %ctx.instance_id,
            stage = %ctx.stage,
            pid = ?child.id(),
            dir = %stage_dir.display(),
            "stage started"
        );

        let stdout = child.stdout.take().context("agent stdout was not captured")?;
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut content = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut content).await;
            }
            content
        });

        // Bytes are copied verbatim; undecodable lines are the parser's concern.
        let mut reader = BufReader::new(stdout);
        let mut reported_error: Option<String> = None;
        let pump = async {
            let mut line = Vec::new();
            loop {
                line.clear();
                if reader.read_until(b'\n', &mut line).await? == 0 {
                    break;
                }
                if !line.ends_with(b"\n") {
                    line.push(b'\n');
                }
                if let Some(message) = result_error(&line) {
                    reported_error = Some(message);
                }
                log.write_all(&line).await?;
                log.flush().await?;
            }
            anyhow::Ok(())
        };

        let ended = tokio::select! {
            result = pump => {
                result.with_context(|| format!("Failed to copy agent output to {}", log_path.display()))?;
                Ended::Exited
            }
            _ = cancel.cancelled() => Ended::Cancelled,
            _ = tokio::time::sleep(self.timeout) => Ended::TimedOut,
        };
        if !matches!(ended, Ended::Exited)
            && let Err(e) = child.kill().await
        {
            tracing::warn!(instance_id = %ctx.instance_id, stage = %ctx.stage, error = %e, "failed to kill agent");
        }
        let status = child.wait().await.context("Failed to wait for agent")?;
        let stderr_content = stderr_task.await.unwrap_or_default();

        let (cancelled, timed_out) = match ended {
            Ended::Exited => (false, false),
            Ended::Cancelled => (true, false),
            Ended::TimedOut => (false, true),
        };
        let success =
            !cancelled && !timed_out && status.success() && reported_error.is_none();
        let error = if success {
            None
        } else if cancelled {
            Some("cancelled".to_string())
        } else if timed_out {
            Some(format!("timed out after {}s", self.timeout.as_secs()))
        } else if let Some(message) = reported_error {
            Some(format!("agent reported an error: {}", message))
        } else if stderr_content.trim().is_empty() {
            Some(format!("agent exited with {}", status))
        } else {
            Some(format!("agent failed: {}", stderr_content.trim()))
        };

        let outcome = StageOutcome {
            stage: ctx.stage,
            stage_dir: stage_dir.clone(),
            exit_code: status.code(),
            success,
            cancelled,
            timed_out,
            duration_ms: started.elapsed().as_millis() as u64,
            error,
        };
        let summary = serde_json::to_vec_pretty(&outcome).context("Failed to encode stage summary")?;
        tokio::fs::write(stage_dir.join(SUMMARY_FILE), summary)
            .await
            .context("Failed to write stage summary")?;

        tracing::info!(
            instance_id = %ctx.instance_id,
            stage = %ctx.stage,
            success,
            exit_code = ?outcome.exit_code,
            duration_ms = outcome.duration_ms,
            "stage finished"
        );
        Ok(outcome)
    }
}
