use std::path::PathBuf;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub use pipewright_common::{LogCategory, Stage, StagePosition};

use crate::errors::{WorkflowError, WorkflowResult};

// Instance ids become branch names and directory names, so keep them to a
// conservative character set.
static INSTANCE_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").unwrap());

pub fn validate_instance_id(id: &str) -> WorkflowResult<()> {
    if INSTANCE_ID_REGEX.is_match(id) {
        Ok(())
    } else {
        Err(WorkflowError::validation(
            Some(id),
            "instance id must be 1-64 characters of [A-Za-z0-9_-] starting with a letter or digit",
        ))
    }
}

/// Allocate a fresh 8-character instance id.
pub fn new_instance_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    InProgress,
    Completed,
    Errored,
    Stuck,
    Merged,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::Stuck => "stuck",
            Self::Merged => "merged",
        }
    }

    /// Legal status edges. `Stuck` is a heuristic flag, so it can clear back
    /// to `InProgress` when activity resumes.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                | (Self::Pending, Self::Errored)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Errored)
                | (Self::InProgress, Self::Stuck)
                | (Self::Stuck, Self::InProgress)
                | (Self::Stuck, Self::Completed)
                | (Self::Stuck, Self::Errored)
                | (Self::Completed, Self::Merged)
        )
    }

    /// Statuses in which an agent may still be executing.
    pub fn is_running(self) -> bool {
        matches!(self, Self::InProgress | Self::Stuck)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "errored" => Ok(Self::Errored),
            "stuck" => Ok(Self::Stuck),
            "merged" => Ok(Self::Merged),
            _ => Err(format!("Invalid instance status: {}", s)),
        }
    }
}

/// One end-to-end execution of a recipe against one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: String,
    pub recipe_name: String,
    pub stages: Vec<Stage>,
    pub current_stage: StagePosition,
    pub status: InstanceStatus,
    pub branch_name: Option<String>,
    pub worktree_path: Option<PathBuf>,
    pub ticket_ref: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_reason: Option<String>,
}

impl WorkflowInstance {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Fields needed to insert a fresh instance record.
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub id: String,
    pub recipe_name: String,
    pub stages: Vec<Stage>,
    pub ticket_ref: Option<String>,
}

/// One parsed line of agent output, tagged with its arrival sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageLogEntry {
    pub instance_id: String,
    pub stage: Stage,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub category: LogCategory,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    Created,
    StageChanged,
    StatusChanged,
    WorktreeProvisioned,
    Merged,
    Deleted,
    Restarted,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::StageChanged => "stage_changed",
            Self::StatusChanged => "status_changed",
            Self::WorktreeProvisioned => "worktree_provisioned",
            Self::Merged => "merged",
            Self::Deleted => "deleted",
            Self::Restarted => "restarted",
        }
    }
}

impl FromStr for ActivityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "stage_changed" => Ok(Self::StageChanged),
            "status_changed" => Ok(Self::StatusChanged),
            "worktree_provisioned" => Ok(Self::WorktreeProvisioned),
            "merged" => Ok(Self::Merged),
            "deleted" => Ok(Self::Deleted),
            "restarted" => Ok(Self::Restarted),
            _ => Err(format!("Invalid activity type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityLogEntry {
    pub id: i64,
    pub instance_id: String,
    pub event_type: ActivityType,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupTarget {
    Worktree,
    Branch,
    Artifacts,
}

impl CleanupTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Worktree => "worktree",
            Self::Branch => "branch",
            Self::Artifacts => "artifacts",
        }
    }
}

impl FromStr for CleanupTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "worktree" => Ok(Self::Worktree),
            "branch" => Ok(Self::Branch),
            "artifacts" => Ok(Self::Artifacts),
            _ => Err(format!("Invalid cleanup target: {}", s)),
        }
    }
}

/// A cleanup leg that failed and is waiting for the janitor to retry it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCleanup {
    pub id: i64,
    pub instance_id: String,
    pub target: CleanupTarget,
    /// Filesystem path for worktree/artifacts legs, branch name for the branch leg.
    pub location: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

// API payload types

/// Request to start (or restart) a workflow instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerRequest {
    pub recipe_name: String,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub external_ticket_ref: Option<String>,
    /// Omitted means "start at the recipe's first stage".
    #[serde(default)]
    pub declared_current_stage: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceFilter {
    #[serde(default)]
    pub status: Option<InstanceStatus>,
    #[serde(default)]
    pub stage: Option<StagePosition>,
}

impl InstanceFilter {
    pub fn matches(&self, instance: &WorkflowInstance) -> bool {
        self.status.is_none_or(|s| s == instance.status)
            && self.stage.is_none_or(|s| s == instance.current_stage)
    }
}

/// Whether an instance's log history has been loaded.
///
/// `NotFetched` and `Empty` are deliberately different states: a pane that has
/// not loaded yet must not render as "no output".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "count", rename_all = "snake_case")]
pub enum LogAvailability {
    NotFetched,
    Fetching,
    Empty,
    Populated(usize),
}

impl LogAvailability {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogView {
    pub instance_id: String,
    pub availability: LogAvailability,
    /// Set while transient read errors are being retried.
    pub degraded: bool,
    pub entries: Vec<StageLogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceDetail {
    #[serde(flatten)]
    pub instance: WorkflowInstance,
    pub activity: Vec<ActivityLogEntry>,
    pub log_availability: LogAvailability,
}
