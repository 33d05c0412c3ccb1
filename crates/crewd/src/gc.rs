//! Workspace teardown and the stale workspace collector.
//!
//! A workspace is only ever reclaimed once its attempt is terminal. Failed
//! and stopped attempts are torn down right after they finish; completed
//! ones are kept for review until they age past the GC grace period.

use chrono::Utc;
use crew_core::{
    events::{EventPayload, WorkspaceRemovedPayload},
    Attempt, CleanupStatus,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::storage::{Storage, StorageError};
use crate::workspace::{TeardownError, TeardownReport, WorkspaceManager};

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Teardown(#[from] TeardownError),
    #[error("attempt {0} is not terminal")]
    NotTerminal(String),
}

pub type Result<T> = std::result::Result<T, CleanupError>;

/// Tally of one collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub scanned: u32,
    pub removed: u32,
    pub failed: u32,
}

pub struct WorkspaceCollector {
    storage: Arc<Storage>,
    workspaces: Arc<dyn WorkspaceManager>,
}

impl std::fmt::Debug for WorkspaceCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceCollector").finish_non_exhaustive()
    }
}

impl WorkspaceCollector {
    pub fn new(storage: Arc<Storage>, workspaces: Arc<dyn WorkspaceManager>) -> Self {
        Self {
            storage,
            workspaces,
        }
    }

    /// Tear down the workspace of a terminal attempt and record the result.
    ///
    /// Attempts without a workspace report an empty teardown.
    pub async fn teardown(&self, attempt: &Attempt) -> Result<TeardownReport> {
        if !attempt.status.is_terminal() {
            return Err(CleanupError::NotTerminal(attempt.id.to_string()));
        }
        let Some(workspace) = &attempt.workspace else {
            return Ok(TeardownReport::default());
        };
        let project = self.storage.get_project(&attempt.project_id).await?;

        match self.workspaces.destroy(&project, workspace).await {
            Ok(report) => {
                self.storage
                    .set_cleanup_status(&attempt.id, CleanupStatus::Cleaned, Some(Utc::now()))
                    .await?;
                self.storage
                    .append_event(
                        &attempt.run_id,
                        Some(&attempt.id),
                        &EventPayload::WorkspaceRemoved(WorkspaceRemovedPayload {
                            attempt_id: attempt.id.clone(),
                            removed_worktree: report.removed_worktree,
                            removed_branch: report.removed_branch,
                            removed_dir: report.removed_dir,
                        }),
                    )
                    .await?;
                info!(
                    attempt_id = %attempt.id,
                    path = %workspace.path,
                    removed_worktree = report.removed_worktree,
                    removed_branch = report.removed_branch,
                    removed_dir = report.removed_dir,
                    "workspace removed"
                );
                Ok(report)
            }
            Err(err) => {
                warn!(
                    attempt_id = %attempt.id,
                    path = %workspace.path,
                    step = ?err.step,
                    error = %err.message,
                    "workspace teardown failed"
                );
                self.storage
                    .set_cleanup_status(&attempt.id, CleanupStatus::Failed, None)
                    .await?;
                Err(err.into())
            }
        }
    }

    /// Reclaim workspaces of attempts terminal for at least `min_age_minutes`.
    ///
    /// Failures are counted and the batch continues.
    pub async fn collect(&self, min_age_minutes: u32, limit: u32) -> Result<GcReport> {
        let cutoff = Utc::now() - chrono::Duration::minutes(i64::from(min_age_minutes));
        let candidates = self.storage.list_stale_workspaces(cutoff, limit).await?;

        let mut report = GcReport {
            scanned: candidates.len() as u32,
            ..GcReport::default()
        };
        for attempt in &candidates {
            match self.teardown(attempt).await {
                Ok(_) => report.removed += 1,
                Err(e) => {
                    debug!(attempt_id = %attempt.id, error = %e, "gc candidate not reclaimed");
                    report.failed += 1;
                }
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                removed = report.removed,
                failed = report.failed,
                "workspace gc pass finished"
            );
        }
        Ok(report)
    }

    /// Run `collect` every `interval` until `shutdown` fires.
    pub fn spawn_periodic(
        self: Arc<Self>,
        interval: Duration,
        min_age_minutes: u32,
        limit: u32,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.collect(min_age_minutes, limit).await {
                            warn!(error = %e, "workspace gc pass failed");
                        }
                    }
                }
            }
            debug!("workspace gc loop stopped");
        })
    }
}
