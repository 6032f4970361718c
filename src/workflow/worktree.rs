//! Per-instance git worktrees.
//!
//! Every instance gets a dedicated worktree at `<worktrees_root>/<id>` on
//! branch `<branch_prefix>/<id>`, always cut from the *local* primary branch.
//! Operations on one id are serialised through a per-id lock map; operations
//! that touch shared git metadata (worktree registration, refs, the main
//! checkout) additionally take a repo-wide lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::models::{CleanupTarget, validate_instance_id};
use crate::config::RuntimeConfig;
use crate::errors::{WorkflowError, WorkflowResult};

/// Location of one instance's isolated checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkingCopy {
    pub instance_id: String,
    pub branch: String,
    pub path: PathBuf,
}

/// Outcome of one independent cleanup leg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "error", rename_all = "snake_case")]
pub enum LegOutcome {
    Removed,
    Absent,
    Failed(String),
}

impl LegOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovalReport {
    pub instance_id: String,
    pub worktree: LegOutcome,
    pub branch: LegOutcome,
    pub artifacts: LegOutcome,
    #[serde(skip)]
    locations: [String; 3],
}

impl RemovalReport {
    pub fn new(
        copy: &WorkingCopy,
        artifacts_dir: &Path,
        worktree: LegOutcome,
        branch: LegOutcome,
        artifacts: LegOutcome,
    ) -> Self {
        Self {
            instance_id: copy.instance_id.clone(),
            worktree,
            branch,
            artifacts,
            locations: [
                copy.path.to_string_lossy().into_owned(),
                copy.branch.clone(),
                artifacts_dir.to_string_lossy().into_owned(),
            ],
        }
    }

    pub fn is_clean(&self) -> bool {
        !self.worktree.is_failed() && !self.branch.is_failed() && !self.artifacts.is_failed()
    }

    /// Legs that exhausted their retries: `(target, location, error)`.
    pub fn failures(&self) -> Vec<(CleanupTarget, String, String)> {
        let legs = [
            (CleanupTarget::Worktree, &self.worktree, &self.locations[0]),
            (CleanupTarget::Branch, &self.branch, &self.locations[1]),
            (CleanupTarget::Artifacts, &self.artifacts, &self.locations[2]),
        ];
        legs.into_iter()
            .filter_map(|(target, outcome, location)| match outcome {
                LegOutcome::Failed(err) => Some((target, location.clone(), err.clone())),
                _ => None,
            })
            .collect()
    }
}

/// Isolation backend used by the orchestrator.
#[async_trait]
pub trait WorkingCopies: Send + Sync {
    /// Where the working copy for `instance_id` lives (whether or not it exists).
    fn locate(&self, instance_id: &str) -> WorkingCopy;

    /// Root of the per-stage artifact directories for `instance_id`.
    fn artifacts_dir(&self, instance_id: &str) -> PathBuf;

    async fn provision(&self, instance_id: &str) -> WorkflowResult<WorkingCopy>;

    /// True when the copy exists and is checked out on its instance branch.
    async fn validate(&self, instance_id: &str) -> WorkflowResult<bool>;

    /// Best-effort, idempotent removal of worktree, branch and artifacts.
    async fn remove(&self, instance_id: &str) -> WorkflowResult<RemovalReport>;

    /// Merge the instance branch into the local primary branch. Returns the
    /// resulting commit id.
    async fn integrate(&self, instance_id: &str) -> WorkflowResult<String>;

    /// One attempt at a previously failed cleanup leg.
    async fn retry_cleanup(&self, target: CleanupTarget, location: &str) -> Result<()>;
}

/// Backoff for individual cleanup legs inside `remove`.
#[derive(Debug, Clone, Copy)]
pub struct LegRetry {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for LegRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

async fn with_retry<F, Fut>(retry: LegRetry, leg: &str, instance_id: &str, mut op: F) -> LegOutcome
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<LegOutcome>>,
{
    let mut delay = retry.base_delay;
    let mut last_err = String::new();
    for attempt in 1..=retry.attempts.max(1) {
        match op().await {
            Ok(outcome) => return outcome,
            Err(e) => {
                last_err = format!("{:#}", e);
                tracing::warn!(
                    instance_id,
                    leg,
                    attempt,
                    error = %last_err,
                    "cleanup leg failed"
                );
                if attempt < retry.attempts {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
    LegOutcome::Failed(last_err)
}

async fn git(dir: &Path, args: &[&str]) -> Result<Output> {
    Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .with_context(|| format!("Failed to run git {}", args.join(" ")))
}

/// Run git and return trimmed stdout, failing with stderr on non-zero exit.
async fn git_ok(dir: &Path, args: &[&str]) -> Result<String> {
    let output = git(dir, args).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("git {} failed: {}", args.join(" "), stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

async fn ref_exists(dir: &Path, reference: &str) -> Result<bool> {
    let output = git(dir, &["rev-parse", "--verify", "--quiet", reference]).await?;
    Ok(output.status.success())
}

pub struct GitWorktreeManager {
    repo_path: PathBuf,
    worktrees_root: PathBuf,
    artifacts_root: PathBuf,
    primary_branch: String,
    branch_prefix: String,
    retry: LegRetry,
    id_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    repo_lock: Mutex<()>,
}

impl GitWorktreeManager {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            repo_path: config.repo_path.clone(),
            worktrees_root: config.worktrees_root.clone(),
            artifacts_root: config.artifacts_root.clone(),
            primary_branch: config.primary_branch.clone(),
            branch_prefix: config.branch_prefix.clone(),
            retry: LegRetry::default(),
            id_locks: std::sync::Mutex::new(HashMap::new()),
            repo_lock: Mutex::new(()),
        }
    }

    pub fn with_retry(mut self, retry: LegRetry) -> Self {
        self.retry = retry;
        self
    }

    fn id_lock(&self, instance_id: &str) -> WorkflowResult<Arc<Mutex<()>>> {
        let mut locks = self.id_locks.lock().map_err(|_| WorkflowError::LockPoisoned)?;
        Ok(locks
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    /// Drop the id's lock entry once nobody holds or awaits it.
    fn prune_lock(&self, instance_id: &str) {
        let Ok(mut locks) = self.id_locks.lock() else {
            return;
        };
        if locks
            .get(instance_id)
            .is_some_and(|m| Arc::strong_count(m) == 1)
        {
            locks.remove(instance_id);
        }
    }

    #[cfg(test)]
    fn tracked_ids(&self) -> usize {
        self.id_locks.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// Claim the id without waiting; an in-flight operation is a conflict.
    fn try_claim(&self, instance_id: &str) -> WorkflowResult<OwnedMutexGuard<()>> {
        self.id_lock(instance_id)?
            .try_lock_owned()
            .map_err(|_| {
                WorkflowError::conflict(
                    instance_id,
                    "another working-copy operation is already in flight",
                )
            })
    }

    async fn claim(&self, instance_id: &str) -> WorkflowResult<OwnedMutexGuard<()>> {
        Ok(self.id_lock(instance_id)?.lock_owned().await)
    }

    async fn is_registered(&self, path: &Path) -> Result<bool> {
        let listing = git_ok(&self.repo_path, &["worktree", "list", "--porcelain"]).await?;
        let wanted = path.to_string_lossy();
        Ok(listing
            .lines()
            .filter_map(|l| l.strip_prefix("worktree "))
            .any(|p| Path::new(p) == path || p == wanted))
    }

    async fn remove_worktree_leg(&self, path: &Path) -> Result<LegOutcome> {
        let _repo = self.repo_lock.lock().await;
        let registered = self.is_registered(path).await?;
        if !registered && !path.exists() {
            return Ok(LegOutcome::Absent);
        }
        if registered {
            let path_str = path.to_str().context("Worktree path contains invalid UTF-8")?;
            let output = git(&self.repo_path, &["worktree", "remove", "--force", path_str]).await?;
            if !output.status.success() && path.exists() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                anyhow::bail!("git worktree remove failed: {}", stderr.trim());
            }
        }
        if path.exists() {
            tokio::fs::remove_dir_all(path)
                .await
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        git_ok(&self.repo_path, &["worktree", "prune"]).await?;
        Ok(LegOutcome::Removed)
    }

    async fn remove_branch_leg(&self, branch: &str) -> Result<LegOutcome> {
        let _repo = self.repo_lock.lock().await;
        if !ref_exists(&self.repo_path, &format!("refs/heads/{}", branch)).await? {
            return Ok(LegOutcome::Absent);
        }
        git_ok(&self.repo_path, &["branch", "-D", branch]).await?;
        Ok(LegOutcome::Removed)
    }

    async fn remove_dir_leg(path: &Path) -> Result<LegOutcome> {
        if !path.exists() {
            return Ok(LegOutcome::Absent);
        }
        tokio::fs::remove_dir_all(path)
            .await
            .with_context(|| format!("Failed to remove {}", path.display()))?;
        Ok(LegOutcome::Removed)
    }

    async fn conflicted_files(&self) -> Vec<String> {
        match git_ok(&self.repo_path, &["diff", "--name-only", "--diff-filter=U"]).await {
            Ok(out) => out.lines().map(str::to_string).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "could not list conflicted files");
                Vec::new()
            }
        }
    }

    async fn restore_head(&self, original: &str) {
        if original == self.primary_branch || original == "HEAD" {
            return;
        }
        if let Err(e) = git_ok(&self.repo_path, &["checkout", original]).await {
            tracing::error!(branch = original, error = %e, "checkout recovery failed");
        }
    }
}

#[async_trait]
impl WorkingCopies for GitWorktreeManager {
    fn locate(&self, instance_id: &str) -> WorkingCopy {
        WorkingCopy {
            instance_id: instance_id.to_string(),
            branch: format!("{}/{}", self.branch_prefix, instance_id),
            path: self.worktrees_root.join(instance_id),
        }
    }

    fn artifacts_dir(&self, instance_id: &str) -> PathBuf {
        self.artifacts_root.join(instance_id)
    }

    async fn provision(&self, instance_id: &str) -> WorkflowResult<WorkingCopy> {
        validate_instance_id(instance_id)?;
        let _claim = self.try_claim(instance_id)?;
        let copy = self.locate(instance_id);
        let with_id = |e: anyhow::Error| WorkflowError::from(e).for_instance(instance_id);

        let _repo = self.repo_lock.lock().await;
        git_ok(&self.repo_path, &["worktree", "prune"]).await.map_err(with_id)?;

        if copy.path.exists() || self.is_registered(&copy.path).await.map_err(with_id)? {
            return Err(WorkflowError::conflict(
                instance_id,
                format!("a live working copy already exists at {}", copy.path.display()),
            ));
        }
        if ref_exists(&self.repo_path, &format!("refs/heads/{}", copy.branch))
            .await
            .map_err(with_id)?
        {
            return Err(WorkflowError::conflict(
                instance_id,
                format!("branch {} already exists", copy.branch),
            ));
        }

        let base = format!("refs/heads/{}", self.primary_branch);
        if !ref_exists(&self.repo_path, &base).await.map_err(with_id)? {
            return Err(WorkflowError::validation(
                Some(instance_id),
                format!("local primary branch '{}' does not exist", self.primary_branch),
            ));
        }

        tokio::fs::create_dir_all(&self.worktrees_root)
            .await
            .with_context(|| format!("Failed to create {}", self.worktrees_root.display()))
            .map_err(with_id)?;
        let path_str = copy
            .path
            .to_str()
            .context("Worktree path contains invalid UTF-8")
            .map_err(with_id)?;
        git_ok(
            &self.repo_path,
            &["worktree", "add", "-b", &copy.branch, path_str, &base],
        )
        .await
        .map_err(with_id)?;

        tracing::info!(
            instance_id,
            branch = %copy.branch,
            path = %copy.path.display(),
            "provisioned working copy"
        );
        Ok(copy)
    }

    async fn validate(&self, instance_id: &str) -> WorkflowResult<bool> {
        validate_instance_id(instance_id)?;
        let copy = self.locate(instance_id);
        if !copy.path.exists() {
            return Ok(false);
        }
        let valid = tokio::task::spawn_blocking(move || {
            let repo = match git2::Repository::open(&copy.path) {
                Ok(repo) => repo,
                Err(_) => return false,
            };
            if !repo.is_worktree() {
                return false;
            }
            repo.head()
                .ok()
                .and_then(|head| head.shorthand().map(|s| s == copy.branch))
                .unwrap_or(false)
        })
        .await
        .context("validate task panicked")
        .map_err(|e| WorkflowError::from(e).for_instance(instance_id))?;
        Ok(valid)
    }

    async fn remove(&self, instance_id: &str) -> WorkflowResult<RemovalReport> {
        validate_instance_id(instance_id)?;
        let claim = self.claim(instance_id).await?;
        let copy = self.locate(instance_id);
        let artifacts = self.artifacts_dir(instance_id);

        let worktree = with_retry(self.retry, "worktree", instance_id, || {
            self.remove_worktree_leg(&copy.path)
        })
        .await;
        let branch = with_retry(self.retry, "branch", instance_id, || {
            self.remove_branch_leg(&copy.branch)
        })
        .await;
        let artifacts_outcome = with_retry(self.retry, "artifacts", instance_id, || {
            Self::remove_dir_leg(&artifacts)
        })
        .await;

        let report = RemovalReport::new(&copy, &artifacts, worktree, branch, artifacts_outcome);
        drop(claim);
        self.prune_lock(instance_id);
        tracing::info!(instance_id, clean = report.is_clean(), "removed working copy");
        Ok(report)
    }

    async fn integrate(&self, instance_id: &str) -> WorkflowResult<String> {
        validate_instance_id(instance_id)?;
        let copy = self.locate(instance_id);
        let with_id = |e: anyhow::Error| WorkflowError::from(e).for_instance(instance_id);
        let _repo = self.repo_lock.lock().await;

        if !ref_exists(&self.repo_path, &format!("refs/heads/{}", copy.branch))
            .await
            .map_err(with_id)?
        {
            return Err(WorkflowError::not_found(
                instance_id,
                format!("Branch {}", copy.branch),
            ));
        }

        let original = git_ok(&self.repo_path, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .map_err(with_id)?;
        if original != self.primary_branch {
            git_ok(&self.repo_path, &["checkout", &self.primary_branch])
                .await
                .map_err(with_id)?;
        }

        let message = format!("Merge {}", copy.branch);
        let output = git(
            &self.repo_path,
            &["merge", "--no-ff", "-m", &message, &copy.branch],
        )
        .await
        .map_err(with_id)?;

        if !output.status.success() {
            let conflicts = self.conflicted_files().await;
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            tracing::warn!(
                instance_id,
                branch = %copy.branch,
                conflicts = conflicts.len(),
                "merge failed, aborting"
            );
            if let Err(e) = git_ok(&self.repo_path, &["merge", "--abort"]).await {
                tracing::error!(instance_id, error = %e, "merge --abort failed");
            }
            self.restore_head(&original).await;
            if conflicts.is_empty() {
                return Err(with_id(anyhow::anyhow!(
                    "merge of {} failed: {}",
                    copy.branch,
                    stderr
                )));
            }
            return Err(WorkflowError::Integration {
                instance_id: Some(instance_id.to_string()),
                branch: copy.branch,
                conflicts,
            });
        }

        let head = git_ok(&self.repo_path, &["rev-parse", "HEAD"])
            .await
            .map_err(with_id)?;
        self.restore_head(&original).await;
        tracing::info!(instance_id, branch = %copy.branch, commit = %head, "merged instance branch");
        Ok(head)
    }

    async fn retry_cleanup(&self, target: CleanupTarget, location: &str) -> Result<()> {
        let outcome = match target {
            CleanupTarget::Worktree => self.remove_worktree_leg(Path::new(location)).await?,
            CleanupTarget::Branch => self.remove_branch_leg(location).await?,
            CleanupTarget::Artifacts => Self::remove_dir_leg(Path::new(location)).await?,
        };
        tracing::debug!(target = target.as_str(), location, ?outcome, "cleanup retried");
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn manager(dir: &Path) -> GitWorktreeManager {
        GitWorktreeManager::new(&RuntimeConfig::for_project(dir)).with_retry(LegRetry {
            attempts: 2,
            base_delay: Duration::from_millis(5),
        })
    }

    #[tokio::test]
    async fn test_provision_creates_branch_from_local_primary() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let mgr = manager(dir.path());

        let copy = mgr.provision("wf-1").await.unwrap();
        assert!(copy.path.exists());
        assert_eq!(copy.branch, "pipewright/wf-1");
        assert!(copy.path.ends_with(".pipewright/worktrees/wf-1"));

        let main_sha = run_git(dir.path(), &["rev-parse", "refs/heads/main"]);
        let branch_sha = run_git(dir.path(), &["rev-parse", "refs/heads/pipewright/wf-1"]);
        assert_eq!(main_sha, branch_sha);
        assert!(mgr.validate("wf-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_second_provision_is_conflict() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let mgr = manager(dir.path());

        mgr.provision("wf-1").await.unwrap();
        let err = mgr.provision("wf-1").await.unwrap_err();
        assert!(matches!(err, WorkflowError::ResourceConflict { .. }));
        assert_eq!(err.instance_id(), Some("wf-1"));
    }

    #[tokio::test]
    async fn test_concurrent_provision_yields_one_copy() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let mgr = manager(dir.path());

        let (a, b) = tokio::join!(mgr.provision("wf-race"), mgr.provision("wf-race"));
        let successes = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(successes, 1);
        for result in [a, b] {
            if let Err(e) = result {
                assert!(matches!(e, WorkflowError::ResourceConflict { .. }));
            }
        }
        let listing = run_git(dir.path(), &["worktree", "list", "--porcelain"]);
        let copies = listing
            .lines()
            .filter(|l| l.starts_with("worktree ") && l.ends_with("wf-race"))
            .count();
        assert_eq!(copies, 1);
    }

    #[tokio::test]
    async fn test_missing_primary_branch_is_validation_error() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let mut config = RuntimeConfig::for_project(dir.path());
        config.primary_branch = "trunk".into();
        let mgr = GitWorktreeManager::new(&config);

        let err = mgr.provision("wf-1").await.unwrap_err();
        assert!(matches!(err, WorkflowError::Validation { .. }));
        assert!(!mgr.locate("wf-1").path.exists());
    }

    #[tokio::test]
    async fn test_invalid_id_is_rejected_before_touching_git() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let err = mgr.provision("../escape").await.unwrap_err();
        assert!(matches!(err, WorkflowError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent_and_cleans_all_legs() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let mgr = manager(dir.path());

        let copy = mgr.provision("wf-1").await.unwrap();
        let artifacts = mgr.artifacts_dir("wf-1").join("build_abc123");
        std::fs::create_dir_all(&artifacts).unwrap();
        std::fs::write(artifacts.join("raw_output.jsonl"), "{}\n").unwrap();

        let first = mgr.remove("wf-1").await.unwrap();
        assert!(first.is_clean());
        assert_eq!(first.worktree, LegOutcome::Removed);
        assert_eq!(first.branch, LegOutcome::Removed);
        assert_eq!(first.artifacts, LegOutcome::Removed);
        assert!(!copy.path.exists());
        assert!(!mgr.artifacts_dir("wf-1").exists());
        assert_eq!(mgr.tracked_ids(), 0);
        assert!(!mgr.validate("wf-1").await.unwrap());

        let second = mgr.remove("wf-1").await.unwrap();
        assert!(second.is_clean());
        assert_eq!(second.worktree, LegOutcome::Absent);
        assert_eq!(second.branch, LegOutcome::Absent);
        assert_eq!(second.artifacts, LegOutcome::Absent);
        assert!(second.failures().is_empty());
    }

    #[tokio::test]
    async fn test_remove_never_provisioned_instance() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let report = manager(dir.path()).remove("ghost").await.unwrap();
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_provision_after_remove_succeeds() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let mgr = manager(dir.path());

        mgr.provision("wf-1").await.unwrap();
        mgr.remove("wf-1").await.unwrap();
        let again = mgr.provision("wf-1").await.unwrap();
        assert!(again.path.exists());
    }

    #[tokio::test]
    async fn test_integrate_merges_into_local_primary() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let mgr = manager(dir.path());

        let copy = mgr.provision("wf-1").await.unwrap();
        commit_file(&copy.path, "feature.txt", "done\n", "add feature");

        let sha = mgr.integrate("wf-1").await.unwrap();
        let main_sha = run_git(dir.path(), &["rev-parse", "refs/heads/main"]);
        assert_eq!(sha, main_sha);
        assert!(dir.path().join("feature.txt").exists());
        let parents = run_git(dir.path(), &["rev-list", "--parents", "-n", "1", "main"]);
        assert_eq!(parents.split_whitespace().count(), 3, "expected a merge commit");
    }

    #[tokio::test]
    async fn test_integrate_conflict_aborts_and_reports_files() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let mgr = manager(dir.path());

        let copy = mgr.provision("wf-1").await.unwrap();
        commit_file(&copy.path, "README.md", "from branch\n", "branch edit");
        commit_file(dir.path(), "README.md", "from main\n", "main edit");
        let before = run_git(dir.path(), &["rev-parse", "main"]);

        let err = mgr.integrate("wf-1").await.unwrap_err();
        match err {
            WorkflowError::Integration {
                instance_id,
                branch,
                conflicts,
            } => {
                assert_eq!(instance_id.as_deref(), Some("wf-1"));
                assert_eq!(branch, "pipewright/wf-1");
                assert_eq!(conflicts, vec!["README.md".to_string()]);
            }
            other => panic!("Expected Integration error, got {:?}", other),
        }
        assert_eq!(run_git(dir.path(), &["rev-parse", "main"]), before);
        assert!(!dir.path().join(".git").join("MERGE_HEAD").exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("README.md")).unwrap(),
            "from main\n"
        );
    }

    #[tokio::test]
    async fn test_integrate_unknown_branch_is_not_found() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let err = manager(dir.path()).integrate("nope").await.unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_retry_cleanup_removes_leftovers() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let mgr = manager(dir.path());

        let copy = mgr.provision("wf-1").await.unwrap();
        mgr.retry_cleanup(CleanupTarget::Worktree, &copy.path.to_string_lossy())
            .await
            .unwrap();
        assert!(!copy.path.exists());
        mgr.retry_cleanup(CleanupTarget::Branch, &copy.branch).await.unwrap();
        let branches = run_git(dir.path(), &["branch", "--list", "pipewright/*"]);
        assert!(branches.is_empty());

        let stray = dir.path().join("stray-artifacts");
        std::fs::create_dir_all(&stray).unwrap();
        mgr.retry_cleanup(CleanupTarget::Artifacts, &stray.to_string_lossy())
            .await
            .unwrap();
        assert!(!stray.exists());
    }

    #[test]
    fn test_removal_report_failures() {
        let report = RemovalReport {
            instance_id: "wf-1".into(),
            worktree: LegOutcome::Removed,
            branch: LegOutcome::Failed("ref locked".into()),
            artifacts: LegOutcome::Failed("busy".into()),
            locations: ["/wt".into(), "pipewright/wf-1".into(), "/art".into()],
        };
        assert!(!report.is_clean());
        let failures = report.failures();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].0, CleanupTarget::Branch);
        assert_eq!(failures[0].1, "pipewright/wf-1");
        assert_eq!(failures[1].2, "busy");
    }
}
