//! Attempt lifecycle: `pending -> queued -> running -> {completed, failed, stopped}`.
//!
//! Every transition is a conditional write on the persisted status, so a
//! transition that lost a race is reported back instead of applied.

use crew_core::{
    events::{AttemptQueuedPayload, AttemptStartedPayload, EventPayload},
    ArtifactKind, Attempt, AttemptStatus, AttemptWorkspace, ExecutionErrorCode, Id, TaskStatus,
    STOPPED_EXIT_CODE,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::storage::{Result, Storage, Termination};
use crate::tasks::TaskStore;

/// How an attempt ended.
#[derive(Debug, Clone)]
pub enum Outcome {
    Completed {
        diff: String,
        summary: String,
        cost_usd: Option<f64>,
    },
    Failed {
        exit_code: Option<i32>,
        code: ExecutionErrorCode,
        message: String,
        /// Artifact body; the message is used when absent.
        detail: Option<String>,
        cost_usd: Option<f64>,
    },
    Stopped {
        reason: String,
    },
}

impl Outcome {
    fn into_termination(self) -> Termination {
        match self {
            Self::Completed {
                diff,
                summary,
                cost_usd,
            } => {
                let mut artifacts = vec![(ArtifactKind::Diff, diff)];
                if !summary.trim().is_empty() {
                    artifacts.push((ArtifactKind::Summary, summary));
                }
                Termination {
                    status: AttemptStatus::Completed,
                    exit_code: Some(0),
                    error_code: None,
                    error_message: None,
                    cost_usd,
                    artifacts,
                }
            }
            Self::Failed {
                exit_code,
                code,
                message,
                detail,
                cost_usd,
            } => Termination {
                status: AttemptStatus::Failed,
                exit_code,
                error_code: Some(code),
                artifacts: vec![(ArtifactKind::Error, detail.unwrap_or_else(|| message.clone()))],
                error_message: Some(message),
                cost_usd,
            },
            Self::Stopped { reason } => Termination {
                status: AttemptStatus::Stopped,
                exit_code: Some(STOPPED_EXIT_CODE),
                error_code: None,
                artifacts: vec![(ArtifactKind::Error, reason.clone())],
                error_message: Some(reason),
                cost_usd: None,
            },
        }
    }
}

/// Applies attempt transitions and the task column moves tied to them.
pub struct AttemptLifecycle {
    storage: Arc<Storage>,
    tasks: Arc<dyn TaskStore>,
}

impl std::fmt::Debug for AttemptLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttemptLifecycle").finish_non_exhaustive()
    }
}

impl AttemptLifecycle {
    pub fn new(storage: Arc<Storage>, tasks: Arc<dyn TaskStore>) -> Self {
        Self { storage, tasks }
    }

    /// `pending -> queued`. Returns false if the attempt was no longer pending.
    pub async fn mark_queued(&self, attempt: &Attempt) -> Result<bool> {
        if !self
            .storage
            .advance_attempt(&attempt.id, AttemptStatus::Queued)
            .await?
        {
            debug!(attempt_id = %attempt.id, "attempt no longer pending; not queued");
            return Ok(false);
        }

        self.storage
            .append_event(
                &attempt.run_id,
                Some(&attempt.id),
                &EventPayload::AttemptQueued(AttemptQueuedPayload {
                    attempt_id: attempt.id.clone(),
                    task_id: attempt.task_id.clone(),
                    queue_position: attempt.queue_position,
                }),
            )
            .await?;
        info!(
            attempt_id = %attempt.id,
            run_id = %attempt.run_id,
            queue_position = attempt.queue_position,
            "attempt queued"
        );
        Ok(true)
    }

    /// `queued -> running`. Returns false if the attempt was no longer queued.
    pub async fn mark_running(&self, attempt: &Attempt) -> Result<bool> {
        if !self
            .storage
            .advance_attempt(&attempt.id, AttemptStatus::Running)
            .await?
        {
            debug!(attempt_id = %attempt.id, "attempt no longer queued; not started");
            return Ok(false);
        }

        if let Err(e) = self
            .tasks
            .set_status(&attempt.task_id, TaskStatus::InProgress)
            .await
        {
            warn!(task_id = %attempt.task_id, error = %e, "failed to move task to in_progress");
        }
        info!(attempt_id = %attempt.id, task_id = %attempt.task_id, "attempt running");
        Ok(true)
    }

    /// Record the workspace of a running attempt and log ATTEMPT_STARTED.
    pub async fn attach_workspace(&self, attempt: &Attempt, workspace: &AttemptWorkspace) -> Result<()> {
        self.storage
            .set_attempt_workspace(&attempt.id, workspace)
            .await?;
        self.storage
            .append_event(
                &attempt.run_id,
                Some(&attempt.id),
                &EventPayload::AttemptStarted(AttemptStartedPayload {
                    attempt_id: attempt.id.clone(),
                    branch_name: workspace.branch_name.clone(),
                    worktree_path: workspace.path.clone(),
                }),
            )
            .await?;
        Ok(())
    }

    /// Apply a terminal transition.
    ///
    /// Returns the terminal attempt if this call's write took effect, `None`
    /// if the attempt was already terminal.
    pub async fn finish(&self, attempt_id: &Id, outcome: Outcome) -> Result<Option<Attempt>> {
        let termination = outcome.into_termination();
        let status = termination.status;

        if !self.storage.finish_attempt(attempt_id, &termination).await? {
            debug!(attempt_id = %attempt_id, status = status.as_str(), "attempt already terminal");
            return Ok(None);
        }

        let attempt = self.storage.get_attempt(attempt_id).await?;
        if status == AttemptStatus::Completed {
            if let Err(e) = self
                .tasks
                .set_status(&attempt.task_id, TaskStatus::InReview)
                .await
            {
                warn!(task_id = %attempt.task_id, error = %e, "failed to move task to in_review");
            }
        }

        match status {
            AttemptStatus::Completed => info!(attempt_id = %attempt_id, "attempt completed"),
            _ => warn!(
                attempt_id = %attempt_id,
                status = status.as_str(),
                exit_code = ?attempt.exit_code,
                error_code = ?attempt.error_code.map(|c| c.as_str()),
                message = attempt.error_message.as_deref().unwrap_or(""),
                "attempt finished"
            ),
        }
        Ok(Some(attempt))
    }
}
