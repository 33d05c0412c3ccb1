//! Run-level status aggregation and finalization.
//!
//! Counts are never tracked here; every view re-derives them from the
//! attempt rows.

use crew_core::{
    events::{EventPayload, RunFinishedPayload},
    Attempt, Id, Run, RunCounts, RunStatus,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::storage::{Result, Storage};

/// Current run of a project, as shown on the board.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatusView {
    pub has_run: bool,
    pub run_id: Option<Id>,
    pub status: Option<RunStatus>,
    pub max_parallel: Option<u32>,
    pub counts: RunCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunDetail {
    pub run: Run,
    pub attempts: Vec<Attempt>,
}

#[derive(Debug)]
pub struct RunLifecycle {
    storage: Arc<Storage>,
}

impl RunLifecycle {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// The running run of a project, else its most recent one.
    pub async fn status_for_project(&self, project_id: &Id) -> Result<RunStatusView> {
        let run = match self.storage.running_run(project_id).await? {
            Some(run) => Some(run),
            None => self.storage.latest_run(project_id).await?,
        };
        Ok(match run {
            Some(run) => RunStatusView {
                has_run: true,
                run_id: Some(run.id),
                status: Some(run.status),
                max_parallel: Some(run.max_parallel),
                counts: run.counts,
            },
            None => RunStatusView {
                has_run: false,
                run_id: None,
                status: None,
                max_parallel: None,
                counts: RunCounts::default(),
            },
        })
    }

    pub async fn history(&self, project_id: &Id, limit: u32) -> Result<Vec<Run>> {
        self.storage.list_runs(project_id, limit).await
    }

    pub async fn detail(&self, run_id: &Id) -> Result<RunDetail> {
        let run = self.storage.get_run(run_id).await?;
        let attempts = self.storage.list_attempts(run_id).await?;
        Ok(RunDetail { run, attempts })
    }

    /// Finalize a running run once none of its attempts is active.
    ///
    /// The run fails if any attempt failed, otherwise it completes. Returns
    /// the new status if this call finalized the run.
    pub async fn refresh(&self, run_id: &Id) -> Result<Option<RunStatus>> {
        let run = self.storage.get_run(run_id).await?;
        if run.status != RunStatus::Running || run.counts.active() > 0 {
            return Ok(None);
        }

        let (status, reason) = if run.counts.failed > 0 {
            (
                RunStatus::Failed,
                Some(format!("{} attempt(s) failed", run.counts.failed)),
            )
        } else {
            (RunStatus::Completed, None)
        };
        let finished = self
            .storage
            .finish_run(
                run_id,
                status,
                reason.as_deref(),
                &EventPayload::RunFinished(RunFinishedPayload {
                    run_id: run_id.clone(),
                    status,
                    reason: reason.clone(),
                }),
            )
            .await?;
        if !finished {
            return Ok(None);
        }

        info!(
            run_id = %run_id,
            status = status.as_str(),
            completed = run.counts.completed,
            failed = run.counts.failed,
            stopped = run.counts.stopped,
            "run finished"
        );
        Ok(Some(status))
    }

    /// Mark a running run cancelled. Returns false if it was already terminal.
    pub async fn cancel(&self, run_id: &Id, reason: &str) -> Result<bool> {
        let cancelled = self
            .storage
            .finish_run(
                run_id,
                RunStatus::Cancelled,
                Some(reason),
                &EventPayload::RunFinished(RunFinishedPayload {
                    run_id: run_id.clone(),
                    status: RunStatus::Cancelled,
                    reason: Some(reason.to_string()),
                }),
            )
            .await?;
        if cancelled {
            info!(run_id = %run_id, reason, "run cancelled");
        }
        Ok(cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::*;
    use crate::storage::Termination;
    use crew_core::{AttemptStatus, TaskStatus};

    async fn terminate(storage: &Storage, id: &Id, status: AttemptStatus) {
        storage.advance_attempt(id, AttemptStatus::Queued).await.unwrap();
        storage.advance_attempt(id, AttemptStatus::Running).await.unwrap();
        storage
            .finish_attempt(
                id,
                &Termination {
                    status,
                    exit_code: Some(0),
                    error_code: None,
                    error_message: None,
                    cost_usd: None,
                    artifacts: vec![],
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn status_without_runs() {
        let ts = create_test_storage().await;
        let project = seed_project(&ts.storage, "/tmp/repo").await;
        let view = RunLifecycle::new(ts.storage.clone())
            .status_for_project(&project.id)
            .await
            .unwrap();
        assert!(!view.has_run);
        assert_eq!(view.counts.total(), 0);
    }

    #[tokio::test]
    async fn refresh_waits_for_all_attempts() {
        let ts = create_test_storage().await;
        let project = seed_project(&ts.storage, "/tmp/repo").await;
        let t1 = seed_task(&ts.storage, &project, TaskStatus::Todo).await;
        let t2 = seed_task(&ts.storage, &project, TaskStatus::Todo).await;
        let (run, attempts) = seed_run(&ts.storage, &project, &[t1, t2], 2).await;
        let runs = RunLifecycle::new(ts.storage.clone());

        terminate(&ts.storage, &attempts[0].id, AttemptStatus::Completed).await;
        assert_eq!(runs.refresh(&run.id).await.unwrap(), None);

        terminate(&ts.storage, &attempts[1].id, AttemptStatus::Completed).await;
        assert_eq!(
            runs.refresh(&run.id).await.unwrap(),
            Some(RunStatus::Completed)
        );
        assert_eq!(runs.refresh(&run.id).await.unwrap(), None);

        let view = runs.status_for_project(&project.id).await.unwrap();
        assert!(view.has_run);
        assert_eq!(view.status, Some(RunStatus::Completed));
        assert_eq!(view.counts.completed, 2);
    }

    #[tokio::test]
    async fn any_failed_attempt_fails_the_run() {
        let ts = create_test_storage().await;
        let project = seed_project(&ts.storage, "/tmp/repo").await;
        let t1 = seed_task(&ts.storage, &project, TaskStatus::Todo).await;
        let t2 = seed_task(&ts.storage, &project, TaskStatus::Todo).await;
        let (run, attempts) = seed_run(&ts.storage, &project, &[t1, t2], 2).await;
        let runs = RunLifecycle::new(ts.storage.clone());

        terminate(&ts.storage, &attempts[0].id, AttemptStatus::Failed).await;
        terminate(&ts.storage, &attempts[1].id, AttemptStatus::Completed).await;
        assert_eq!(runs.refresh(&run.id).await.unwrap(), Some(RunStatus::Failed));

        let stored = ts.storage.get_run(&run.id).await.unwrap();
        assert_eq!(stored.error.as_deref(), Some("1 attempt(s) failed"));
    }

    #[tokio::test]
    async fn cancel_is_one_shot_and_history_is_newest_first() {
        let ts = create_test_storage().await;
        let project = seed_project(&ts.storage, "/tmp/repo").await;
        let task = seed_task(&ts.storage, &project, TaskStatus::Todo).await;
        let runs = RunLifecycle::new(ts.storage.clone());

        let (first, _) = seed_run(&ts.storage, &project, &[task.clone()], 1).await;
        assert!(runs.cancel(&first.id, "user").await.unwrap());
        assert!(!runs.cancel(&first.id, "user").await.unwrap());

        let (second, _) = seed_run(&ts.storage, &project, &[task], 1).await;
        let history = runs.history(&project.id, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, second.id);

        let detail = runs.detail(&first.id).await.unwrap();
        assert_eq!(detail.run.status, RunStatus::Cancelled);
        assert_eq!(detail.attempts.len(), 1);
    }
}
