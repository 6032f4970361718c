//! Layered configuration for pipewright.
//!
//! Settings are read from `.pipewright/pipewright.toml`, then overridden by
//! environment variables (a `.env` file in the project directory is loaded
//! first), then by CLI flags applied by the binary.
//!
//! ```toml
//! [repo]
//! primary_branch = "main"
//! branch_prefix = "pipewright"
//! worktrees_dir = ".pipewright/worktrees"
//! artifacts_dir = ".pipewright/agents"
//!
//! [engine]
//! log_buffer_capacity = 1000
//! broadcast_capacity = 1024
//! stuck_threshold_secs = 1800
//! monitor_interval_secs = 60
//! tail_poll_interval_ms = 250
//! cleanup_max_attempts = 5
//!
//! [agent]
//! claude_cmd = "claude"
//! skip_permissions = true
//! stage_timeout_secs = 3600
//!
//! [server]
//! port = 3141
//! db_path = ".pipewright/pipewright.db"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const CONFIG_DIR: &str = ".pipewright";
pub const CONFIG_FILE: &str = "pipewright.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    /// Local branch every working copy is cut from. Never a remote-tracking ref.
    pub primary_branch: String,
    pub branch_prefix: String,
    pub worktrees_dir: PathBuf,
    pub artifacts_dir: PathBuf,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            primary_branch: "main".to_string(),
            branch_prefix: "pipewright".to_string(),
            worktrees_dir: PathBuf::from(CONFIG_DIR).join("worktrees"),
            artifacts_dir: PathBuf::from(CONFIG_DIR).join("agents"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub log_buffer_capacity: usize,
    pub broadcast_capacity: usize,
    /// An in-progress instance with no activity for this long is flagged stuck.
    pub stuck_threshold_secs: u64,
    pub monitor_interval_secs: u64,
    pub tail_poll_interval_ms: u64,
    pub cleanup_max_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_buffer_capacity: 1000,
            broadcast_capacity: 1024,
            stuck_threshold_secs: 30 * 60,
            monitor_interval_secs: 60,
            tail_poll_interval_ms: 250,
            cleanup_max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub claude_cmd: String,
    pub skip_permissions: bool,
    pub stage_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            claude_cmd: "claude".to_string(),
            skip_permissions: true,
            stage_timeout_secs: 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3141,
            db_path: PathBuf::from(CONFIG_DIR).join("pipewright.db"),
        }
    }
}

/// Everything that can appear in `pipewright.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipewrightConfig {
    pub repo: RepoConfig,
    pub engine: EngineConfig,
    pub agent: AgentConfig,
    pub server: ServerConfig,
}

impl PipewrightConfig {
    pub fn config_path(project_dir: &Path) -> PathBuf {
        project_dir.join(CONFIG_DIR).join(CONFIG_FILE)
    }

    /// Load the file layer (defaults when absent) and then the environment layer.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let env_file = project_dir.join(".env");
        if env_file.exists() {
            dotenvy::from_path(&env_file)
                .with_context(|| format!("Failed to load {}", env_file.display()))?;
        }
        let mut config = Self::load_file(&Self::config_path(project_dir))?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse pipewright.toml")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PIPEWRIGHT_*` overrides. The lookup is injected so tests do not
    /// have to mutate the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("PIPEWRIGHT_PRIMARY_BRANCH") {
            self.repo.primary_branch = v;
        }
        if let Some(v) = lookup("PIPEWRIGHT_BRANCH_PREFIX") {
            self.repo.branch_prefix = v;
        }
        if let Some(v) = lookup("PIPEWRIGHT_STUCK_THRESHOLD_SECS") {
            self.engine.stuck_threshold_secs = v
                .parse()
                .context("PIPEWRIGHT_STUCK_THRESHOLD_SECS must be an integer")?;
        }
        if let Some(v) = lookup("PIPEWRIGHT_LOG_BUFFER_CAPACITY") {
            self.engine.log_buffer_capacity = v
                .parse()
                .context("PIPEWRIGHT_LOG_BUFFER_CAPACITY must be an integer")?;
        }
        if let Some(v) = lookup("PIPEWRIGHT_PORT") {
            self.server.port = v.parse().context("PIPEWRIGHT_PORT must be a port number")?;
        }
        if let Some(v) = lookup("CLAUDE_CMD") {
            self.agent.claude_cmd = v;
        }
        if let Some(v) = lookup("SKIP_PERMISSIONS") {
            self.agent.skip_permissions = v != "false";
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.repo.primary_branch.trim().is_empty() {
            anyhow::bail!("repo.primary_branch must not be empty");
        }
        if self.repo.primary_branch.starts_with("origin/")
            || self.repo.primary_branch.starts_with("refs/remotes/")
        {
            anyhow::bail!(
                "repo.primary_branch must name a local branch, got '{}'",
                self.repo.primary_branch
            );
        }
        if self.engine.log_buffer_capacity == 0 {
            anyhow::bail!("engine.log_buffer_capacity must be at least 1");
        }
        if self.engine.broadcast_capacity == 0 {
            anyhow::bail!("engine.broadcast_capacity must be at least 1");
        }
        if self.engine.stuck_threshold_secs == 0 {
            anyhow::bail!("engine.stuck_threshold_secs must be at least 1");
        }
        Ok(())
    }

    /// Resolve relative paths against the project directory.
    pub fn resolve(&self, project_dir: &Path) -> RuntimeConfig {
        let abs = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                project_dir.join(p)
            }
        };
        RuntimeConfig {
            repo_path: project_dir.to_path_buf(),
            primary_branch: self.repo.primary_branch.clone(),
            branch_prefix: self.repo.branch_prefix.clone(),
            worktrees_root: abs(&self.repo.worktrees_dir),
            artifacts_root: abs(&self.repo.artifacts_dir),
            db_path: abs(&self.server.db_path),
            port: self.server.port,
            log_buffer_capacity: self.engine.log_buffer_capacity,
            broadcast_capacity: self.engine.broadcast_capacity,
            stuck_threshold: Duration::from_secs(self.engine.stuck_threshold_secs),
            monitor_interval: Duration::from_secs(self.engine.monitor_interval_secs.max(1)),
            tail_poll_interval: Duration::from_millis(self.engine.tail_poll_interval_ms.max(10)),
            cleanup_max_attempts: self.engine.cleanup_max_attempts,
            claude_cmd: self.agent.claude_cmd.clone(),
            skip_permissions: self.agent.skip_permissions,
            stage_timeout: Duration::from_secs(self.agent.stage_timeout_secs.max(1)),
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}

/// Fully-resolved settings consumed by the running engine.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub repo_path: PathBuf,
    pub primary_branch: String,
    pub branch_prefix: String,
    pub worktrees_root: PathBuf,
    pub artifacts_root: PathBuf,
    pub db_path: PathBuf,
    pub port: u16,
    pub log_buffer_capacity: usize,
    pub broadcast_capacity: usize,
    pub stuck_threshold: Duration,
    pub monitor_interval: Duration,
    pub tail_poll_interval: Duration,
    pub cleanup_max_attempts: u32,
    pub claude_cmd: String,
    pub skip_permissions: bool,
    pub stage_timeout: Duration,
}

impl RuntimeConfig {
    /// Defaults rooted at `project_dir`; convenient for tests.
    pub fn for_project(project_dir: &Path) -> Self {
        PipewrightConfig::default().resolve(project_dir)
    }
}
