use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;

/// Async-safe handle to the state database.
///
/// Wraps `StateDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<StateDb>>,
}

impl DbHandle {
    pub fn new(db: StateDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&StateDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup, the CLI and
    /// tests; never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, StateDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// Timestamps are stored as fixed-width RFC 3339 text so that string order
/// matches time order inside SQL comparisons.
fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp in database: {}", s))?
        .with_timezone(&Utc))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

const INSTANCE_COLUMNS: &str = "id, recipe_name, stages, current_stage, status, branch_name, \
     worktree_path, ticket_ref, error, created_at, updated_at, last_activity_at, completed_at, \
     deleted_at, deleted_reason";

pub struct StateDb {
    conn: Connection,
}

impl StateDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory {}", parent.display())
            })?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .context("Failed to configure connection")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS workflow_instances (
                    id TEXT PRIMARY KEY,
                    recipe_name TEXT NOT NULL,
                    stages TEXT NOT NULL,
                    current_stage TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    branch_name TEXT,
                    worktree_path TEXT,
                    ticket_ref TEXT,
                    error TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    last_activity_at TEXT NOT NULL,
                    completed_at TEXT,
                    deleted_at TEXT,
                    deleted_reason TEXT
                );

                CREATE TABLE IF NOT EXISTS activity_log (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    instance_id TEXT NOT NULL REFERENCES workflow_instances(id) ON DELETE CASCADE,
                    event_type TEXT NOT NULL,
                    old_value TEXT,
                    new_value TEXT,
                    timestamp TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS pending_cleanups (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    instance_id TEXT NOT NULL,
                    target TEXT NOT NULL,
                    location TEXT NOT NULL,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT,
                    created_at TEXT NOT NULL,
                    UNIQUE(instance_id, target)
                );

                CREATE INDEX IF NOT EXISTS idx_instances_status ON workflow_instances(status);
                CREATE INDEX IF NOT EXISTS idx_instances_deleted ON workflow_instances(deleted_at);
                CREATE INDEX IF NOT EXISTS idx_activity_instance ON activity_log(instance_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Instances ─────────────────────────────────────────────────────

    pub fn create_instance(&self, new: &NewInstance, current: StagePosition) -> Result<WorkflowInstance> {
        let now = ts(Utc::now());
        let stages = serde_json::to_string(&new.stages).context("Failed to encode stages")?;
        self.conn
            .execute(
                "INSERT INTO workflow_instances
                    (id, recipe_name, stages, current_stage, status, ticket_ref, created_at, updated_at, last_activity_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?6, ?6)",
                params![new.id, new.recipe_name, stages, current.as_str(), new.ticket_ref, now],
            )
            .with_context(|| format!("Failed to insert instance {}", new.id))?;
        self.get_instance(&new.id)?
            .context("Instance not found after insert")
    }

    /// Fetch a record by id, including tombstoned ones.
    pub fn get_instance(&self, id: &str) -> Result<Option<WorkflowInstance>> {
        let sql = format!("SELECT {} FROM workflow_instances WHERE id = ?1", INSTANCE_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], InstanceRow::from_row)
            .optional()
            .context("Failed to query instance")?;
        row.map(InstanceRow::into_instance).transpose()
    }

    /// Live instances matching `filter`, newest first. Tombstones are excluded.
    pub fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<WorkflowInstance>> {
        let sql = format!(
            "SELECT {} FROM workflow_instances
             WHERE deleted_at IS NULL
               AND (?1 IS NULL OR status = ?1)
               AND (?2 IS NULL OR current_stage = ?2)
             ORDER BY created_at DESC, id",
            INSTANCE_COLUMNS
        );
        let status = filter.status.map(|s| s.as_str());
        let stage = filter.stage.map(|s| s.as_str());
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_instances")?;
        let rows = stmt
            .query_map(params![status, stage], InstanceRow::from_row)
            .context("Failed to query instances")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("Failed to read instance row")?.into_instance()?);
        }
        Ok(out)
    }

    pub fn update_stage(&self, id: &str, position: StagePosition) -> Result<WorkflowInstance> {
        let now = ts(Utc::now());
        self.conn
            .execute(
                "UPDATE workflow_instances SET current_stage = ?1, updated_at = ?2, last_activity_at = ?2 WHERE id = ?3",
                params![position.as_str(), now, id],
            )
            .context("Failed to update instance stage")?;
        self.get_instance(id)?
            .context("Instance not found after stage update")
    }

    pub fn update_status(
        &self,
        id: &str,
        status: InstanceStatus,
        error: Option<&str>,
    ) -> Result<WorkflowInstance> {
        let now = ts(Utc::now());
        if status == InstanceStatus::Completed {
            self.conn
                .execute(
                    "UPDATE workflow_instances SET status = ?1, error = ?2, updated_at = ?3, completed_at = ?3 WHERE id = ?4",
                    params![status.as_str(), error, now, id],
                )
                .context("Failed to update instance status")?;
        } else {
            self.conn
                .execute(
                    "UPDATE workflow_instances SET status = ?1, error = ?2, updated_at = ?3 WHERE id = ?4",
                    params![status.as_str(), error, now, id],
                )
                .context("Failed to update instance status")?;
        }
        self.get_instance(id)?
            .context("Instance not found after status update")
    }

    pub fn set_worktree(&self, id: &str, branch: &str, path: &Path) -> Result<WorkflowInstance> {
        let now = ts(Utc::now());
        self.conn
            .execute(
                "UPDATE workflow_instances SET branch_name = ?1, worktree_path = ?2, updated_at = ?3 WHERE id = ?4",
                params![branch, path.to_string_lossy(), now, id],
            )
            .context("Failed to record worktree")?;
        self.get_instance(id)?
            .context("Instance not found after worktree update")
    }

    /// Record that the instance produced output just now.
    pub fn touch_activity(&self, id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE workflow_instances SET last_activity_at = ?1 WHERE id = ?2",
                params![ts(Utc::now()), id],
            )
            .context("Failed to touch instance activity")?;
        Ok(())
    }

    /// Soft-delete: the record stays for history but leaves every listing.
    pub fn tombstone(&self, id: &str, reason: Option<&str>) -> Result<bool> {
        let now = ts(Utc::now());
        let changed = self
            .conn
            .execute(
                "UPDATE workflow_instances SET deleted_at = ?1, deleted_reason = ?2, updated_at = ?1
                 WHERE id = ?3 AND deleted_at IS NULL",
                params![now, reason, id],
            )
            .context("Failed to tombstone instance")?;
        Ok(changed > 0)
    }

    /// Running instances whose last output is older than `cutoff`.
    pub fn stale_running(&self, cutoff: DateTime<Utc>) -> Result<Vec<WorkflowInstance>> {
        let sql = format!(
            "SELECT {} FROM workflow_instances
             WHERE deleted_at IS NULL AND status = 'in_progress' AND last_activity_at < ?1
             ORDER BY last_activity_at",
            INSTANCE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare stale_running")?;
        let rows = stmt
            .query_map(params![ts(cutoff)], InstanceRow::from_row)
            .context("Failed to query stale instances")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("Failed to read instance row")?.into_instance()?);
        }
        Ok(out)
    }

    // ── Activity log ──────────────────────────────────────────────────

    pub fn record_activity(
        &self,
        instance_id: &str,
        event_type: ActivityType,
        old_value: Option<&str>,
        new_value: Option<&str>,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO activity_log (instance_id, event_type, old_value, new_value, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![instance_id, event_type.as_str(), old_value, new_value, ts(Utc::now())],
            )
            .context("Failed to insert activity")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Activity for one instance, oldest first.
    pub fn list_activity(&self, instance_id: &str, limit: Option<usize>) -> Result<Vec<ActivityLogEntry>> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, instance_id, event_type, old_value, new_value, timestamp FROM (
                    SELECT * FROM activity_log WHERE instance_id = ?1 ORDER BY id DESC LIMIT ?2
                 ) ORDER BY id ASC",
            )
            .context("Failed to prepare list_activity")?;
        let rows = stmt
            .query_map(params![instance_id, limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .context("Failed to query activity")?;
        let mut out = Vec::new();
        for row in rows {
            let (id, instance_id, event_type, old_value, new_value, timestamp) =
                row.context("Failed to read activity row")?;
            out.push(ActivityLogEntry {
                id,
                instance_id,
                event_type: ActivityType::from_str(&event_type)
                    .map_err(|e| anyhow::anyhow!(e))
                    .context("Failed to parse activity type")?,
                old_value,
                new_value,
                timestamp: parse_ts(&timestamp)?,
            });
        }
        Ok(out)
    }

    // ── Pending cleanups ──────────────────────────────────────────────

    /// Queue a failed cleanup leg. Re-queueing the same leg keeps one row.
    pub fn enqueue_cleanup(
        &self,
        instance_id: &str,
        target: CleanupTarget,
        location: &str,
        error: &str,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO pending_cleanups (instance_id, target, location, attempts, last_error, created_at)
                 VALUES (?1, ?2, ?3, 1, ?4, ?5)
                 ON CONFLICT(instance_id, target) DO UPDATE SET
                    location = excluded.location, last_error = excluded.last_error,
                    attempts = attempts + 1",
                params![instance_id, target.as_str(), location, error, ts(Utc::now())],
            )
            .context("Failed to enqueue cleanup")?;
        let id = self
            .conn
            .query_row(
                "SELECT id FROM pending_cleanups WHERE instance_id = ?1 AND target = ?2",
                params![instance_id, target.as_str()],
                |row| row.get(0),
            )
            .context("Failed to read cleanup id")?;
        Ok(id)
    }

    /// Cleanups that have not yet exhausted `max_attempts`.
    pub fn list_cleanups(&self, max_attempts: u32) -> Result<Vec<PendingCleanup>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, instance_id, target, location, attempts, last_error, created_at
                 FROM pending_cleanups WHERE attempts < ?1 ORDER BY id",
            )
            .context("Failed to prepare list_cleanups")?;
        self.collect_cleanups(&mut stmt, params![max_attempts])
    }

    /// Every queued cleanup, including exhausted ones.
    pub fn all_cleanups(&self) -> Result<Vec<PendingCleanup>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, instance_id, target, location, attempts, last_error, created_at
                 FROM pending_cleanups ORDER BY id",
            )
            .context("Failed to prepare all_cleanups")?;
        self.collect_cleanups(&mut stmt, params![])
    }

    fn collect_cleanups<P: rusqlite::Params>(
        &self,
        stmt: &mut rusqlite::Statement<'_>,
        params: P,
    ) -> Result<Vec<PendingCleanup>> {
        let rows = stmt
            .query_map(params, |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, u32>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .context("Failed to query cleanups")?;
        let mut out = Vec::new();
        for row in rows {
            let (id, instance_id, target, location, attempts, last_error, created_at) =
                row.context("Failed to read cleanup row")?;
            out.push(PendingCleanup {
                id,
                instance_id,
                target: CleanupTarget::from_str(&target)
                    .map_err(|e| anyhow::anyhow!(e))
                    .context("Failed to parse cleanup target")?,
                location,
                attempts,
                last_error,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(out)
    }

    pub fn bump_cleanup(&self, id: i64, error: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE pending_cleanups SET attempts = attempts + 1, last_error = ?1 WHERE id = ?2",
                params![error, id],
            )
            .context("Failed to bump cleanup attempts")?;
        Ok(())
    }

    pub fn resolve_cleanup(&self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM pending_cleanups WHERE id = ?1", params![id])
            .context("Failed to resolve cleanup")?;
        Ok(())
    }
}

// ── Row helpers ───────────────────────────────────────────────────────

/// Intermediate row struct for workflow_instances.
struct InstanceRow {
    id: String,
    recipe_name: String,
    stages: String,
    current_stage: String,
    status: String,
    branch_name: Option<String>,
    worktree_path: Option<String>,
    ticket_ref: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
    last_activity_at: String,
    completed_at: Option<String>,
    deleted_at: Option<String>,
    deleted_reason: Option<String>,
}

impl InstanceRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            recipe_name: row.get(1)?,
            stages: row.get(2)?,
            current_stage: row.get(3)?,
            status: row.get(4)?,
            branch_name: row.get(5)?,
            worktree_path: row.get(6)?,
            ticket_ref: row.get(7)?,
            error: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
            last_activity_at: row.get(11)?,
            completed_at: row.get(12)?,
            deleted_at: row.get(13)?,
            deleted_reason: row.get(14)?,
        })
    }

    fn into_instance(self) -> Result<WorkflowInstance> {
        let stages: Vec<Stage> =
            serde_json::from_str(&self.stages).context("Failed to parse stages JSON")?;
        let current_stage = StagePosition::from_str(&self.current_stage)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse current stage")?;
        let status = InstanceStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse instance status")?;
        Ok(WorkflowInstance {
            id: self.id,
            recipe_name: self.recipe_name,
            stages,
            current_stage,
            status,
            branch_name: self.branch_name,
            worktree_path: self.worktree_path.map(PathBuf::from),
            ticket_ref: self.ticket_ref,
            error: self.error,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            last_activity_at: parse_ts(&self.last_activity_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            deleted_at: parse_opt_ts(self.deleted_at)?,
            deleted_reason: self.deleted_reason,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
