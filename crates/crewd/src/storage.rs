//! SQLite storage module for the orchestrator daemon.
//!
//! Persists projects, tasks, runs, attempts, terminal artifacts, audit events
//! and processed webhook deliveries. Run counts are never stored: every read
//! re-derives them from the attempt rows.

use chrono::{DateTime, Utc};
use crew_core::{
    events::{AttemptFinishedPayload, EventPayload, PrStatusChangedPayload},
    Artifact, ArtifactKind, Attempt, AttemptStatus, AttemptWorkspace, CleanupStatus, Event,
    ExecutionErrorCode, Id, MergeStatus, PrStatus, Project, PullRequest, Run, RunCounts,
    RunStatus, Task, TaskStatus,
};
use sha2::{Digest, Sha256};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite, SqliteConnection};
use std::path::Path;
use thiserror::Error;

/// Explicit column list for attempts table queries.
const ATTEMPTS_COLUMNS: &str = "id, task_id, run_id, project_id, status, queue_position, \
    queued_at, started_at, finished_at, exit_code, error_code, error_message, worktree_path, \
    branch_name, base_branch, base_commit, cleanup_status, cleaned_at, merge_status, \
    conflict_files, apply_error, pr_number, pr_url, pr_status, cost_usd, created_at";

const RUNS_COLUMNS: &str =
    "id, project_id, status, max_parallel, selected_task_ids, started_at, finished_at, error";

const TASKS_COLUMNS: &str = "id, project_id, title, description, status, created_at, updated_at";

const PROJECTS_COLUMNS: &str = "id, name, repo_path, repo_url, default_branch, created_at";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("project not found: {0}")]
    ProjectNotFound(String),
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("attempt not found: {0}")]
    AttemptNotFound(String),
    #[error("project already has a running run: {0}")]
    RunAlreadyActive(String),
    #[error("unsupported attempt transition to {0}")]
    InvalidTransition(&'static str),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Everything written together with a terminal attempt status.
#[derive(Debug, Clone)]
pub struct Termination {
    pub status: AttemptStatus,
    pub exit_code: Option<i32>,
    pub error_code: Option<ExecutionErrorCode>,
    pub error_message: Option<String>,
    pub cost_usd: Option<f64>,
    pub artifacts: Vec<(ArtifactKind, String)>,
}

/// Result of recording a pull-request webhook delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryRecord {
    /// The delivery id was already recorded; nothing was written.
    Duplicate,
    /// Delivery recorded; the attempt already carried this status.
    Unchanged,
    /// Delivery recorded and the attempt's PR status changed.
    Updated { from: Option<PrStatus> },
}

/// Storage backend for the daemon.
#[derive(Debug)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Create a new storage instance with the given database path.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Run embedded migrations.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                    let msg = e.to_string();
                    // Ignore expected idempotent errors (duplicate column, table exists).
                    if !msg.contains("duplicate column") && !msg.contains("already exists") {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    // --- Project operations ---

    pub async fn insert_project(&self, project: &Project) -> Result<()> {
        sqlx::query(
            "INSERT INTO projects (id, name, repo_path, repo_url, default_branch, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(project.id.as_ref())
        .bind(&project.name)
        .bind(&project.repo_path)
        .bind(&project.repo_url)
        .bind(&project.default_branch)
        .bind(project.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_project(&self, id: &Id) -> Result<Project> {
        let query = format!("SELECT {PROJECTS_COLUMNS} FROM projects WHERE id = ?1");
        let row = sqlx::query_as::<_, ProjectRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::ProjectNotFound(id.to_string()))?;
        Ok(row.into_project())
    }

    /// Projects that declare a remote URL (webhook routing candidates).
    pub async fn list_projects_with_remote(&self) -> Result<Vec<Project>> {
        let query = format!(
            "SELECT {PROJECTS_COLUMNS} FROM projects WHERE repo_url IS NOT NULL ORDER BY created_at"
        );
        let rows = sqlx::query_as::<_, ProjectRow>(&query)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(ProjectRow::into_project).collect())
    }

    // --- Task operations ---

    pub async fn insert_task(&self, task: &Task) -> Result<()> {
        sqlx::query(
            "INSERT INTO tasks (id, project_id, title, description, status, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(task.id.as_ref())
        .bind(task.project_id.as_ref())
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.status.as_str())
        .bind(task.created_at.timestamp_millis())
        .bind(task.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_task(&self, id: &Id) -> Result<Task> {
        let query = format!("SELECT {TASKS_COLUMNS} FROM tasks WHERE id = ?1");
        let row = sqlx::query_as::<_, TaskRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::TaskNotFound(id.to_string()))?;
        Ok(row.into_task())
    }

    /// Tasks of a project in an admissible column, oldest first.
    pub async fn list_runnable_tasks(&self, project_id: &Id) -> Result<Vec<Task>> {
        let query = format!(
            "SELECT {TASKS_COLUMNS} FROM tasks WHERE project_id = ?1 \
             AND status IN ('todo', 'in_progress', 'in_review') ORDER BY created_at, id"
        );
        let rows = sqlx::query_as::<_, TaskRow>(&query)
            .bind(project_id.as_ref())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(TaskRow::into_task).collect())
    }

    pub async fn update_task_status(&self, id: &Id, status: TaskStatus) -> Result<()> {
        let result = sqlx::query("UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(Utc::now().timestamp_millis())
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::TaskNotFound(id.to_string()));
        }
        Ok(())
    }

    // --- Run operations ---

    /// Insert a run together with its pending attempts and RUN_STARTED event.
    ///
    /// Fails with `RunAlreadyActive` when the project already has a running run.
    pub async fn create_run(
        &self,
        run: &Run,
        attempts: &[Attempt],
        started: &EventPayload,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO runs (id, project_id, status, max_parallel, selected_task_ids, \
             started_at, finished_at, error) VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL)",
        )
        .bind(run.id.as_ref())
        .bind(run.project_id.as_ref())
        .bind(run.status.as_str())
        .bind(i64::from(run.max_parallel))
        .bind(serde_json::to_string(&run.selected_task_ids)?)
        .bind(run.started_at.timestamp_millis())
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(StorageError::RunAlreadyActive(run.project_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        for attempt in attempts {
            sqlx::query(
                "INSERT INTO attempts (id, task_id, run_id, project_id, status, queue_position, \
                 created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .bind(attempt.id.as_ref())
            .bind(attempt.task_id.as_ref())
            .bind(attempt.run_id.as_ref())
            .bind(attempt.project_id.as_ref())
            .bind(attempt.status.as_str())
            .bind(i64::from(attempt.queue_position))
            .bind(attempt.created_at.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }

        insert_event(&mut tx, &run.id, None, started).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_run(&self, id: &Id) -> Result<Run> {
        let query = format!("SELECT {RUNS_COLUMNS} FROM runs WHERE id = ?1");
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::RunNotFound(id.to_string()))?;
        let counts = self.run_counts(id).await?;
        Ok(row.into_run(counts))
    }

    /// Most recently started run of a project, whatever its status.
    pub async fn latest_run(&self, project_id: &Id) -> Result<Option<Run>> {
        Ok(self.list_runs(project_id, 1).await?.into_iter().next())
    }

    pub async fn running_run(&self, project_id: &Id) -> Result<Option<Run>> {
        let query = format!(
            "SELECT {RUNS_COLUMNS} FROM runs WHERE project_id = ?1 AND status = 'running' LIMIT 1"
        );
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(project_id.as_ref())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let counts = self.run_counts(&Id::from_string(&row.id)).await?;
                Ok(Some(row.into_run(counts)))
            }
            None => Ok(None),
        }
    }

    /// Run history of a project, newest first.
    pub async fn list_runs(&self, project_id: &Id, limit: u32) -> Result<Vec<Run>> {
        let query = format!(
            "SELECT {RUNS_COLUMNS} FROM runs WHERE project_id = ?1 \
             ORDER BY started_at DESC, id DESC LIMIT ?2"
        );
        let rows = sqlx::query_as::<_, RunRow>(&query)
            .bind(project_id.as_ref())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in rows {
            let counts = self.run_counts(&Id::from_string(&row.id)).await?;
            runs.push(row.into_run(counts));
        }
        Ok(runs)
    }

    pub async fn list_running_runs(&self) -> Result<Vec<Run>> {
        let query = format!("SELECT {RUNS_COLUMNS} FROM runs WHERE status = 'running'");
        let rows = sqlx::query_as::<_, RunRow>(&query)
            .fetch_all(&self.pool)
            .await?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in rows {
            let counts = self.run_counts(&Id::from_string(&row.id)).await?;
            runs.push(row.into_run(counts));
        }
        Ok(runs)
    }

    /// Per-status attempt counts, derived from the attempt rows.
    pub async fn run_counts(&self, run_id: &Id) -> Result<RunCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM attempts WHERE run_id = ?1 GROUP BY status",
        )
        .bind(run_id.as_ref())
        .fetch_all(&self.pool)
        .await?;

        let mut counts = RunCounts::default();
        for (status, n) in rows {
            if let Some(status) = AttemptStatus::parse(&status) {
                counts.add(status, n as u32);
            }
        }
        Ok(counts)
    }

    /// Move a running run to a terminal status and log RUN_FINISHED.
    ///
    /// Returns false when the run was no longer running.
    pub async fn finish_run(
        &self,
        id: &Id,
        status: RunStatus,
        error: Option<&str>,
        finished: &EventPayload,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE runs SET status = ?1, finished_at = ?2, error = COALESCE(?3, error) \
             WHERE id = ?4 AND status = 'running'",
        )
        .bind(status.as_str())
        .bind(Utc::now().timestamp_millis())
        .bind(error)
        .bind(id.as_ref())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        insert_event(&mut tx, id, None, finished).await?;
        tx.commit().await?;
        Ok(true)
    }

    // --- Attempt operations ---

    pub async fn get_attempt(&self, id: &Id) -> Result<Attempt> {
        let query = format!("SELECT {ATTEMPTS_COLUMNS} FROM attempts WHERE id = ?1");
        let row = sqlx::query_as::<_, AttemptRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::AttemptNotFound(id.to_string()))?;
        Ok(row.into_attempt())
    }

    /// Attempts of a run in admission order.
    pub async fn list_attempts(&self, run_id: &Id) -> Result<Vec<Attempt>> {
        let query = format!(
            "SELECT {ATTEMPTS_COLUMNS} FROM attempts WHERE run_id = ?1 ORDER BY queue_position"
        );
        let rows = sqlx::query_as::<_, AttemptRow>(&query)
            .bind(run_id.as_ref())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(AttemptRow::into_attempt).collect())
    }

    /// Attempts of a run that have not reached a terminal status.
    pub async fn list_active_attempts(&self, run_id: &Id) -> Result<Vec<Attempt>> {
        let query = format!(
            "SELECT {ATTEMPTS_COLUMNS} FROM attempts WHERE run_id = ?1 \
             AND status IN ('pending', 'queued', 'running') ORDER BY queue_position"
        );
        let rows = sqlx::query_as::<_, AttemptRow>(&query)
            .bind(run_id.as_ref())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(AttemptRow::into_attempt).collect())
    }

    /// Every attempt, across runs, currently in `status`, oldest admission first.
    pub async fn list_attempts_in_status(&self, status: AttemptStatus) -> Result<Vec<Attempt>> {
        let query = format!(
            "SELECT {ATTEMPTS_COLUMNS} FROM attempts WHERE status = ?1 \
             ORDER BY queued_at, queue_position"
        );
        let rows = sqlx::query_as::<_, AttemptRow>(&query)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(AttemptRow::into_attempt).collect())
    }

    /// Next pending attempt of a run by original selection index.
    pub async fn next_pending_attempt(&self, run_id: &Id) -> Result<Option<Attempt>> {
        let query = format!(
            "SELECT {ATTEMPTS_COLUMNS} FROM attempts WHERE run_id = ?1 AND status = 'pending' \
             ORDER BY queue_position LIMIT 1"
        );
        let row = sqlx::query_as::<_, AttemptRow>(&query)
            .bind(run_id.as_ref())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(AttemptRow::into_attempt))
    }

    /// Conditionally move an attempt to `queued` or `running`.
    ///
    /// Returns false if the attempt was not in a valid predecessor status.
    pub async fn advance_attempt(&self, id: &Id, next: AttemptStatus) -> Result<bool> {
        let column = match next {
            AttemptStatus::Queued => "queued_at",
            AttemptStatus::Running => "started_at",
            other => return Err(StorageError::InvalidTransition(other.as_str())),
        };
        let query = format!(
            "UPDATE attempts SET status = ?1, {column} = ?2 WHERE id = ?3 AND status IN ({})",
            status_list(next.predecessors())
        );
        let result = sqlx::query(&query)
            .bind(next.as_str())
            .bind(Utc::now().timestamp_millis())
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_attempt_workspace(&self, id: &Id, workspace: &AttemptWorkspace) -> Result<()> {
        let result = sqlx::query(
            "UPDATE attempts SET worktree_path = ?1, branch_name = ?2, base_branch = ?3, \
             base_commit = ?4 WHERE id = ?5",
        )
        .bind(&workspace.path)
        .bind(&workspace.branch_name)
        .bind(&workspace.base_branch)
        .bind(&workspace.base_commit)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::AttemptNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Apply a terminal transition.
    ///
    /// Status, exit code, error, cleanup scheduling, artifacts and the
    /// ATTEMPT_FINISHED event are committed together. Returns false, writing
    /// nothing, if the attempt was already terminal.
    pub async fn finish_attempt(&self, id: &Id, termination: &Termination) -> Result<bool> {
        let status = termination.status;
        if !status.is_terminal() {
            return Err(StorageError::InvalidTransition(status.as_str()));
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let query = format!(
            "UPDATE attempts SET status = ?1, finished_at = ?2, exit_code = ?3, error_code = ?4, \
             error_message = ?5, cost_usd = COALESCE(?6, cost_usd), \
             cleanup_status = CASE WHEN worktree_path IS NULL THEN cleanup_status ELSE 'scheduled' END \
             WHERE id = ?7 AND status IN ({})",
            status_list(status.predecessors())
        );
        let result = sqlx::query(&query)
            .bind(status.as_str())
            .bind(now.timestamp_millis())
            .bind(termination.exit_code)
            .bind(termination.error_code.map(|c| c.as_str()))
            .bind(&termination.error_message)
            .bind(termination.cost_usd)
            .bind(id.as_ref())
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        for (kind, content) in &termination.artifacts {
            sqlx::query(
                "INSERT INTO artifacts (id, attempt_id, kind, content, checksum, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(Id::new().as_ref())
            .bind(id.as_ref())
            .bind(kind.as_str())
            .bind(content)
            .bind(checksum(content))
            .bind(now.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }

        let (run_id,): (String,) = sqlx::query_as("SELECT run_id FROM attempts WHERE id = ?1")
            .bind(id.as_ref())
            .fetch_one(&mut *tx)
            .await?;
        let payload = EventPayload::AttemptFinished(AttemptFinishedPayload {
            attempt_id: id.clone(),
            status,
            exit_code: termination.exit_code,
            error_code: termination.error_code,
            message: termination.error_message.clone(),
        });
        insert_event(&mut tx, &Id::from_string(run_id), Some(id), &payload).await?;

        tx.commit().await?;
        Ok(true)
    }

    pub async fn set_cleanup_status(
        &self,
        id: &Id,
        status: CleanupStatus,
        cleaned_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query("UPDATE attempts SET cleanup_status = ?1, cleaned_at = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(cleaned_at.map(|t| t.timestamp_millis()))
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Terminal attempts finished at or before `cutoff` whose workspace is not yet cleaned.
    pub async fn list_stale_workspaces(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Attempt>> {
        let query = format!(
            "SELECT {ATTEMPTS_COLUMNS} FROM attempts \
             WHERE status IN ('completed', 'failed', 'stopped') \
             AND finished_at IS NOT NULL AND finished_at <= ?1 \
             AND worktree_path IS NOT NULL \
             AND (cleanup_status IS NULL OR cleanup_status != 'cleaned') \
             ORDER BY finished_at LIMIT ?2"
        );
        let rows = sqlx::query_as::<_, AttemptRow>(&query)
            .bind(cutoff.timestamp_millis())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(AttemptRow::into_attempt).collect())
    }

    pub async fn set_merge_result(
        &self,
        id: &Id,
        status: MergeStatus,
        conflict_files: &[String],
        apply_error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE attempts SET merge_status = ?1, conflict_files = ?2, apply_error = ?3 \
             WHERE id = ?4",
        )
        .bind(status.as_str())
        .bind(serde_json::to_string(conflict_files)?)
        .bind(apply_error)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- Pull-request bookkeeping ---

    /// Completed attempts of a project holding a PR that is still open.
    pub async fn count_open_prs(&self, project_id: &Id) -> Result<u32> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM attempts WHERE project_id = ?1 AND status = 'completed' \
             AND pr_url IS NOT NULL AND (pr_status IS NULL OR pr_status = 'open')",
        )
        .bind(project_id.as_ref())
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u32)
    }

    pub async fn record_pull_request(&self, id: &Id, number: i64, url: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE attempts SET pr_number = ?1, pr_url = ?2, pr_status = 'open' WHERE id = ?3",
        )
        .bind(number)
        .bind(url)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::AttemptNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Most recently started attempt of a project carrying `pr_number`.
    pub async fn find_attempt_by_pr(
        &self,
        project_id: &Id,
        pr_number: i64,
    ) -> Result<Option<Attempt>> {
        let query = format!(
            "SELECT {ATTEMPTS_COLUMNS} FROM attempts WHERE project_id = ?1 AND pr_number = ?2 \
             ORDER BY started_at DESC, created_at DESC LIMIT 1"
        );
        let row = sqlx::query_as::<_, AttemptRow>(&query)
            .bind(project_id.as_ref())
            .bind(pr_number)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(AttemptRow::into_attempt))
    }

    /// Set the PR status only if it differs from the stored value.
    ///
    /// Returns the previous status when a change was written.
    pub async fn update_pr_status(
        &self,
        id: &Id,
        status: PrStatus,
    ) -> Result<Option<Option<PrStatus>>> {
        let mut tx = self.pool.begin().await?;
        let changed = update_pr_status_in(&mut tx, id, status, None).await?;
        tx.commit().await?;
        Ok(changed)
    }

    pub async fn is_delivery_processed(&self, delivery_id: &str) -> Result<bool> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT delivery_id FROM processed_webhook_deliveries WHERE delivery_id = ?1",
        )
        .bind(delivery_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Record a delivery and apply its PR status to the target attempt in one transaction.
    ///
    /// The delivery insert is the idempotency check: a concurrent duplicate
    /// loses the insert and writes nothing.
    pub async fn apply_pr_delivery(
        &self,
        delivery_id: &str,
        event: &str,
        attempt_id: &Id,
        status: PrStatus,
    ) -> Result<DeliveryRecord> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO processed_webhook_deliveries (delivery_id, event, processed_at) \
             VALUES (?1, ?2, ?3)",
        )
        .bind(delivery_id)
        .bind(event)
        .bind(Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(DeliveryRecord::Duplicate);
        }

        let changed = update_pr_status_in(&mut tx, attempt_id, status, Some(delivery_id)).await?;
        tx.commit().await?;

        Ok(match changed {
            Some(from) => DeliveryRecord::Updated { from },
            None => DeliveryRecord::Unchanged,
        })
    }

    // --- Cost ledger ---

    /// Total recorded agent cost of a project since `since`.
    pub async fn sum_cost_since(&self, project_id: &Id, since: DateTime<Utc>) -> Result<f64> {
        let (total,): (f64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(cost_usd), 0.0) FROM attempts \
             WHERE project_id = ?1 AND finished_at >= ?2",
        )
        .bind(project_id.as_ref())
        .bind(since.timestamp_millis())
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    // --- Event operations ---

    /// Append an event to the audit log.
    pub async fn append_event(
        &self,
        run_id: &Id,
        attempt_id: Option<&Id>,
        payload: &EventPayload,
    ) -> Result<Event> {
        let mut conn = self.pool.acquire().await?;
        insert_event(&mut conn, run_id, attempt_id, payload).await
    }

    /// Events of a run in insertion order, optionally only those after event `after`.
    pub async fn list_events(&self, run_id: &Id, after: Option<&str>) -> Result<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT id, run_id, attempt_id, type, ts, payload_json FROM events \
             WHERE run_id = ?1 AND (?2 IS NULL OR id > ?2) ORDER BY id ASC",
        )
        .bind(run_id.as_ref())
        .bind(after)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(EventRow::into_event).collect())
    }

    // --- Artifact operations ---

    pub async fn list_artifacts(&self, attempt_id: &Id) -> Result<Vec<Artifact>> {
        let rows = sqlx::query_as::<_, ArtifactRow>(
            "SELECT id, attempt_id, kind, content, checksum, created_at FROM artifacts \
             WHERE attempt_id = ?1 ORDER BY created_at, kind",
        )
        .bind(attempt_id.as_ref())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ArtifactRow::into_artifact).collect())
    }
}

fn status_list(statuses: &[AttemptStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn checksum(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

async fn insert_event(
    conn: &mut SqliteConnection,
    run_id: &Id,
    attempt_id: Option<&Id>,
    payload: &EventPayload,
) -> Result<Event> {
    let id = Id::new();
    let now = Utc::now();
    let event_type = payload.event_type().as_str().to_string();
    let payload_json = payload.to_json()?;

    sqlx::query(
        "INSERT INTO events (id, run_id, attempt_id, type, ts, payload_json) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .bind(id.as_ref())
    .bind(run_id.as_ref())
    .bind(attempt_id.map(|a| a.as_ref()))
    .bind(&event_type)
    .bind(now.timestamp_millis())
    .bind(&payload_json)
    .execute(&mut *conn)
    .await?;

    Ok(Event {
        id,
        run_id: run_id.clone(),
        attempt_id: attempt_id.cloned(),
        event_type,
        timestamp: now,
        payload_json,
    })
}

/// Returns `Some(previous)` if the stored status was changed.
async fn update_pr_status_in(
    conn: &mut SqliteConnection,
    attempt_id: &Id,
    status: PrStatus,
    delivery_id: Option<&str>,
) -> Result<Option<Option<PrStatus>>> {
    let row: Option<(String, Option<i64>, Option<String>)> =
        sqlx::query_as("SELECT run_id, pr_number, pr_status FROM attempts WHERE id = ?1")
            .bind(attempt_id.as_ref())
            .fetch_optional(&mut *conn)
            .await?;
    let Some((run_id, pr_number, previous)) = row else {
        return Err(StorageError::AttemptNotFound(attempt_id.to_string()));
    };
    let previous = previous.as_deref().and_then(PrStatus::parse);
    if previous == Some(status) {
        return Ok(None);
    }

    sqlx::query("UPDATE attempts SET pr_status = ?1 WHERE id = ?2")
        .bind(status.as_str())
        .bind(attempt_id.as_ref())
        .execute(&mut *conn)
        .await?;

    let payload = EventPayload::PrStatusChanged(PrStatusChangedPayload {
        attempt_id: attempt_id.clone(),
        pr_number: pr_number.unwrap_or_default(),
        from: previous,
        to: status,
        delivery_id: delivery_id.map(String::from),
    });
    insert_event(conn, &Id::from_string(run_id), Some(attempt_id), &payload).await?;

    Ok(Some(previous))
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct ProjectRow {
    id: String,
    name: String,
    repo_path: String,
    repo_url: Option<String>,
    default_branch: String,
    created_at: i64,
}

impl ProjectRow {
    fn into_project(self) -> Project {
        Project {
            id: Id::from_string(self.id),
            name: self.name,
            repo_path: self.repo_path,
            repo_url: self.repo_url,
            default_branch: self.default_branch,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    project_id: String,
    title: String,
    description: Option<String>,
    status: String,
    created_at: i64,
    updated_at: i64,
}

impl TaskRow {
    fn into_task(self) -> Task {
        Task {
            id: Id::from_string(self.id),
            project_id: Id::from_string(self.project_id),
            title: self.title,
            description: self.description,
            status: TaskStatus::parse(&self.status).unwrap_or(TaskStatus::Cancelled),
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    project_id: String,
    status: String,
    max_parallel: i64,
    selected_task_ids: String,
    started_at: i64,
    finished_at: Option<i64>,
    error: Option<String>,
}

impl RunRow {
    fn into_run(self, counts: RunCounts) -> Run {
        Run {
            id: Id::from_string(self.id),
            project_id: Id::from_string(self.project_id),
            status: RunStatus::parse(&self.status).unwrap_or(RunStatus::Failed),
            max_parallel: self.max_parallel as u32,
            selected_task_ids: serde_json::from_str(&self.selected_task_ids).unwrap_or_default(),
            counts,
            started_at: DateTime::from_timestamp_millis(self.started_at).unwrap_or_default(),
            finished_at: self.finished_at.and_then(DateTime::from_timestamp_millis),
            error: self.error,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    id: String,
    task_id: String,
    run_id: String,
    project_id: String,
    status: String,
    queue_position: i64,
    queued_at: Option<i64>,
    started_at: Option<i64>,
    finished_at: Option<i64>,
    exit_code: Option<i32>,
    error_code: Option<String>,
    error_message: Option<String>,
    worktree_path: Option<String>,
    branch_name: Option<String>,
    base_branch: Option<String>,
    base_commit: Option<String>,
    cleanup_status: Option<String>,
    cleaned_at: Option<i64>,
    merge_status: Option<String>,
    conflict_files: Option<String>,
    apply_error: Option<String>,
    pr_number: Option<i64>,
    pr_url: Option<String>,
    pr_status: Option<String>,
    cost_usd: Option<f64>,
    created_at: i64,
}

impl AttemptRow {
    fn into_attempt(self) -> Attempt {
        let error_code = match self.error_code.as_deref() {
            Some("GIT_ERROR") => Some(ExecutionErrorCode::GitError),
            Some("RUNNER_ERROR") => Some(ExecutionErrorCode::RunnerError),
            Some("EMPTY_DIFF") => Some(ExecutionErrorCode::EmptyDiff),
            Some("TIMEOUT") => Some(ExecutionErrorCode::Timeout),
            _ => None,
        };
        let workspace = match (self.worktree_path, self.branch_name) {
            (Some(path), Some(branch_name)) => Some(AttemptWorkspace {
                path,
                branch_name,
                base_branch: self.base_branch.unwrap_or_default(),
                base_commit: self.base_commit.unwrap_or_default(),
            }),
            _ => None,
        };
        let pull_request = match (self.pr_number, self.pr_url) {
            (Some(number), Some(url)) => Some(PullRequest {
                number,
                url,
                status: self
                    .pr_status
                    .as_deref()
                    .and_then(PrStatus::parse)
                    .unwrap_or(PrStatus::Open),
            }),
            _ => None,
        };

        Attempt {
            id: Id::from_string(self.id),
            task_id: Id::from_string(self.task_id),
            run_id: Id::from_string(self.run_id),
            project_id: Id::from_string(self.project_id),
            status: AttemptStatus::parse(&self.status).unwrap_or(AttemptStatus::Failed),
            queue_position: self.queue_position as u32,
            queued_at: self.queued_at.and_then(DateTime::from_timestamp_millis),
            started_at: self.started_at.and_then(DateTime::from_timestamp_millis),
            finished_at: self.finished_at.and_then(DateTime::from_timestamp_millis),
            exit_code: self.exit_code,
            error_code,
            error_message: self.error_message,
            workspace,
            cleanup_status: self.cleanup_status.as_deref().and_then(CleanupStatus::parse),
            cleaned_at: self.cleaned_at.and_then(DateTime::from_timestamp_millis),
            merge_status: self.merge_status.as_deref().and_then(MergeStatus::parse),
            conflict_files: self
                .conflict_files
                .as_deref()
                .and_then(|json| serde_json::from_str(json).ok())
                .unwrap_or_default(),
            apply_error: self.apply_error,
            pull_request,
            cost_usd: self.cost_usd,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    run_id: String,
    attempt_id: Option<String>,
    #[sqlx(rename = "type")]
    event_type: String,
    ts: i64,
    payload_json: String,
}

impl EventRow {
    fn into_event(self) -> Event {
        Event {
            id: Id::from_string(self.id),
            run_id: Id::from_string(self.run_id),
            attempt_id: self.attempt_id.map(Id::from_string),
            event_type: self.event_type,
            timestamp: DateTime::from_timestamp_millis(self.ts).unwrap_or_default(),
            payload_json: self.payload_json,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ArtifactRow {
    id: String,
    attempt_id: String,
    kind: String,
    content: String,
    checksum: String,
    created_at: i64,
}

impl ArtifactRow {
    fn into_artifact(self) -> Artifact {
        Artifact {
            id: Id::from_string(self.id),
            attempt_id: Id::from_string(self.attempt_id),
            kind: ArtifactKind::parse(&self.kind).unwrap_or(ArtifactKind::Error),
            content: self.content,
            checksum: self.checksum,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
        }
    }
}
