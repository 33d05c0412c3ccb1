//! Run scheduler: per-project admission control over a selected task set.
//!
//! Admission state is always recomputed from the persisted attempt rows;
//! the only in-process state is the admission lock that serializes
//! start/stop/slot-free decisions and the worker queue handle.

use chrono::Utc;
use crew_core::{
    events::{EventPayload, RunStartedPayload},
    Attempt, AttemptStatus, Config, ExecutionErrorCode, Id, Run, RunCounts, RunStatus, Task,
};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::gc::WorkspaceCollector;
use crate::lifecycle::{AttemptLifecycle, Outcome};
use crate::run_lifecycle::RunLifecycle;
use crate::runner::AgentRunner;
use crate::safety::{SafetyCode, SafetyGate, SafetyVerdict};
use crate::storage::{Storage, StorageError};
use crate::tasks::TaskStore;
use crate::worker::WorkerQueue;

/// Reason recorded on attempts stopped without an explicit reason.
const DEFAULT_STOP_REASON: &str = "stopped by user";

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("project not found: {0}")]
    ProjectNotFound(String),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("attempt not found: {0}")]
    AttemptNotFound(String),
    #[error("project already has a running run: {0}")]
    AlreadyRunning(String),
    #[error("invalid run configuration: {0}")]
    InvalidConfig(String),
    #[error("preflight failed ({}): {reason}", code.as_str())]
    PreflightFailed { code: SafetyCode, reason: String },
}

impl SchedulerError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Storage(_) => "INTERNAL",
            Self::ProjectNotFound(_) | Self::RunNotFound(_) | Self::AttemptNotFound(_) => {
                "NOT_FOUND"
            }
            Self::AlreadyRunning(_) => "ALREADY_RUNNING",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::PreflightFailed { .. } => "PREFLIGHT_FAILED",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Scheduler settings taken from the daemon config.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub default_max_parallel: u32,
    pub cleanup_on_failure: bool,
}

impl From<&Config> for SchedulerConfig {
    fn from(config: &Config) -> Self {
        Self {
            default_max_parallel: config.max_parallel_default,
            cleanup_on_failure: config.cleanup_on_failure,
        }
    }
}

/// Collaborators the scheduler drives.
pub struct SchedulerParts {
    pub storage: Arc<Storage>,
    pub tasks: Arc<dyn TaskStore>,
    pub gate: Arc<SafetyGate>,
    pub lifecycle: Arc<AttemptLifecycle>,
    pub runs: Arc<RunLifecycle>,
    pub runner: Arc<dyn AgentRunner>,
    pub collector: Arc<WorkspaceCollector>,
    pub queue: WorkerQueue,
}

/// Result of a run-level stop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StopReport {
    pub stopped: bool,
    pub cancelled_count: u32,
    pub failed_to_cancel_count: u32,
}

/// Result of stopping one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AttemptStop {
    /// Status after the stop; the current status if it was already terminal.
    pub status: AttemptStatus,
    /// False if the agent did not confirm termination in time.
    pub signalled: bool,
}

/// What startup recovery did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub interrupted: u32,
    pub requeued: u32,
    pub runs_resumed: u32,
}

pub struct Scheduler {
    storage: Arc<Storage>,
    tasks: Arc<dyn TaskStore>,
    gate: Arc<SafetyGate>,
    lifecycle: Arc<AttemptLifecycle>,
    runs: Arc<RunLifecycle>,
    runner: Arc<dyn AgentRunner>,
    collector: Arc<WorkspaceCollector>,
    queue: WorkerQueue,
    config: SchedulerConfig,
    /// Serializes admission decisions across runs.
    admission: Mutex<()>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(parts: SchedulerParts, config: SchedulerConfig) -> Self {
        Self {
            storage: parts.storage,
            tasks: parts.tasks,
            gate: parts.gate,
            lifecycle: parts.lifecycle,
            runs: parts.runs,
            runner: parts.runner,
            collector: parts.collector,
            queue: parts.queue,
            config,
            admission: Mutex::new(()),
        }
    }

    pub fn runs(&self) -> &Arc<RunLifecycle> {
        &self.runs
    }

    pub fn lifecycle(&self) -> &Arc<AttemptLifecycle> {
        &self.lifecycle
    }

    /// Validate, create a run over `task_ids` (or every runnable task) and
    /// admit its first attempts. Returns without waiting for execution.
    pub async fn start_run(
        &self,
        project_id: &Id,
        task_ids: Option<&[Id]>,
        max_parallel: Option<u32>,
    ) -> Result<Run> {
        let max_parallel = max_parallel.unwrap_or(self.config.default_max_parallel);
        if max_parallel < 1 {
            return Err(SchedulerError::InvalidConfig(
                "max_parallel must be at least 1".to_string(),
            ));
        }

        let project = match self.storage.get_project(project_id).await {
            Ok(project) => project,
            Err(StorageError::ProjectNotFound(id)) => {
                return Err(SchedulerError::ProjectNotFound(id))
            }
            Err(e) => return Err(e.into()),
        };

        let _guard = self.admission.lock().await;

        if let Some(active) = self.storage.running_run(project_id).await? {
            return Err(SchedulerError::AlreadyRunning(active.id.to_string()));
        }

        let tasks = self.eligible_tasks(project_id, task_ids).await?;
        if tasks.is_empty() {
            return Err(SchedulerError::InvalidConfig(
                "no selected task is in an admissible status".to_string(),
            ));
        }

        if let SafetyVerdict::Blocked { code, reason } = self.gate.check(&project).await? {
            warn!(
                project_id = %project_id,
                code = code.as_str(),
                reason = %reason,
                "run blocked by safety gate"
            );
            return Err(SchedulerError::PreflightFailed { code, reason });
        }

        let run = Run {
            id: Id::new(),
            project_id: project_id.clone(),
            status: RunStatus::Running,
            max_parallel,
            selected_task_ids: tasks.iter().map(|t| t.id.clone()).collect(),
            counts: RunCounts::default(),
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        };
        let attempts: Vec<Attempt> = tasks
            .iter()
            .enumerate()
            .map(|(i, task)| Attempt::pending(task, &run.id, i as u32))
            .collect();
        let started = EventPayload::RunStarted(RunStartedPayload {
            run_id: run.id.clone(),
            max_parallel,
            task_ids: run.selected_task_ids.clone(),
        });

        match self.storage.create_run(&run, &attempts, &started).await {
            Ok(()) => {}
            Err(StorageError::RunAlreadyActive(_)) => {
                let active = self
                    .storage
                    .running_run(project_id)
                    .await?
                    .map(|r| r.id.to_string())
                    .unwrap_or_default();
                return Err(SchedulerError::AlreadyRunning(active));
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            run_id = %run.id,
            project_id = %project_id,
            tasks = attempts.len(),
            max_parallel,
            "run started"
        );

        let admitted = self.admit(&run.id).await?;
        info!(run_id = %run.id, admitted, "initial attempts admitted");

        Ok(self.storage.get_run(&run.id).await?)
    }

    /// Selected tasks that exist in the project and are admissible, in caller
    /// order with duplicates dropped.
    async fn eligible_tasks(&self, project_id: &Id, task_ids: Option<&[Id]>) -> Result<Vec<Task>> {
        let Some(task_ids) = task_ids else {
            return Ok(self.tasks.list_runnable(project_id).await?);
        };

        let mut seen = HashSet::new();
        let mut eligible = Vec::with_capacity(task_ids.len());
        for id in task_ids {
            if !seen.insert(id) {
                continue;
            }
            match self.tasks.fetch(id).await? {
                Some(task) if &task.project_id == project_id && task.status.is_admissible() => {
                    eligible.push(task);
                }
                Some(task) => {
                    info!(task_id = %id, status = task.status.as_str(), "task skipped: not admissible");
                }
                None => warn!(task_id = %id, "task skipped: not found"),
            }
        }
        Ok(eligible)
    }

    /// Admit pending attempts of the run while a slot is free.
    ///
    /// Returns the number of attempts admitted.
    pub async fn on_slot_free(&self, run_id: &Id) -> Result<u32> {
        let _guard = self.admission.lock().await;
        self.admit(run_id).await
    }

    /// Caller must hold the admission lock.
    async fn admit(&self, run_id: &Id) -> Result<u32> {
        let run = self.storage.get_run(run_id).await?;
        if run.status != RunStatus::Running {
            return Ok(0);
        }

        let mut occupied = run.counts.occupied();
        let mut admitted = 0;
        while occupied < run.max_parallel {
            let Some(next) = self.storage.next_pending_attempt(run_id).await? else {
                break;
            };
            if self.lifecycle.mark_queued(&next).await? {
                if !self.queue.push(next.id.clone()) {
                    warn!(attempt_id = %next.id, "worker queue closed; attempt left queued");
                }
                admitted += 1;
            }
            occupied = self.storage.run_counts(run_id).await?.occupied();
        }
        Ok(admitted)
    }

    /// Side effects of a terminal transition, run once by whoever won it.
    pub async fn attempt_finished(&self, attempt: &Attempt) {
        if attempt.status != AttemptStatus::Completed && self.config.cleanup_on_failure {
            self.schedule_teardown(attempt);
        }
        if let Err(e) = self.on_slot_free(&attempt.run_id).await {
            warn!(run_id = %attempt.run_id, error = %e, "admission after slot release failed");
        }
        if let Err(e) = self.runs.refresh(&attempt.run_id).await {
            warn!(run_id = %attempt.run_id, error = %e, "run refresh failed");
        }
    }

    /// Tear the attempt's workspace down in the background.
    pub fn schedule_teardown(&self, attempt: &Attempt) {
        if attempt.workspace.is_none() {
            return;
        }
        let collector = Arc::clone(&self.collector);
        let attempt = attempt.clone();
        tokio::spawn(async move {
            if let Err(e) = collector.teardown(&attempt).await {
                warn!(attempt_id = %attempt.id, error = %e, "scheduled teardown failed");
            }
        });
    }

    /// Stop one attempt. Stopping a terminal attempt is a no-op.
    pub async fn stop_attempt(&self, attempt_id: &Id, reason: Option<&str>) -> Result<AttemptStop> {
        let attempt = match self.storage.get_attempt(attempt_id).await {
            Ok(attempt) => attempt,
            Err(StorageError::AttemptNotFound(id)) => {
                return Err(SchedulerError::AttemptNotFound(id))
            }
            Err(e) => return Err(e.into()),
        };
        if attempt.status.is_terminal() {
            return Ok(AttemptStop {
                status: attempt.status,
                signalled: true,
            });
        }
        self.stop_one(&attempt, reason.unwrap_or(DEFAULT_STOP_REASON))
            .await
    }

    async fn stop_one(&self, attempt: &Attempt, reason: &str) -> Result<AttemptStop> {
        let mut signalled = true;
        if attempt.status == AttemptStatus::Running {
            if let Err(e) = self.runner.stop(&attempt.id).await {
                warn!(attempt_id = %attempt.id, error = %e, "agent did not confirm stop");
                signalled = false;
            }
        }

        let status = match self
            .lifecycle
            .finish(
                &attempt.id,
                Outcome::Stopped {
                    reason: reason.to_string(),
                },
            )
            .await?
        {
            Some(finished) => {
                info!(attempt_id = %attempt.id, reason, "attempt stopped");
                if attempt.status == AttemptStatus::Queued {
                    // The worker may have picked it up since it was loaded.
                    if let Err(e) = self.runner.stop(&attempt.id).await {
                        warn!(attempt_id = %attempt.id, error = %e, "agent did not confirm stop");
                        signalled = false;
                    }
                }
                self.attempt_finished(&finished).await;
                finished.status
            }
            None => self.storage.get_attempt(&attempt.id).await?.status,
        };

        Ok(AttemptStop { status, signalled })
    }

    /// Cancel a run and stop every attempt that has not finished.
    ///
    /// Attempts are stopped concurrently. Per-attempt failures are counted,
    /// never returned.
    pub async fn stop_run(&self, run_id: &Id, reason: Option<&str>) -> Result<StopReport> {
        let reason = reason.unwrap_or(DEFAULT_STOP_REASON);
        match self.storage.get_run(run_id).await {
            Ok(_) => {}
            Err(StorageError::RunNotFound(id)) => return Err(SchedulerError::RunNotFound(id)),
            Err(e) => return Err(e.into()),
        }

        let cancelled = {
            let _guard = self.admission.lock().await;
            self.runs.cancel(run_id, reason).await?
        };
        if !cancelled {
            return Ok(StopReport::default());
        }

        let mut report = StopReport {
            stopped: true,
            ..StopReport::default()
        };
        let attempts = self.storage.list_active_attempts(run_id).await?;
        let results = join_all(
            attempts
                .iter()
                .map(|attempt| self.stop_one(attempt, reason)),
        )
        .await;
        for (attempt, result) in attempts.iter().zip(results) {
            match result {
                Ok(AttemptStop {
                    status: AttemptStatus::Stopped,
                    signalled: true,
                }) => report.cancelled_count += 1,
                Ok(_) => report.failed_to_cancel_count += 1,
                Err(e) => {
                    warn!(attempt_id = %attempt.id, error = %e, "failed to stop attempt");
                    report.failed_to_cancel_count += 1;
                }
            }
        }

        info!(
            run_id = %run_id,
            cancelled = report.cancelled_count,
            failed_to_cancel = report.failed_to_cancel_count,
            "run stopped"
        );
        Ok(report)
    }

    /// Resume from persisted state after a restart.
    ///
    /// Attempts left running lost their agent and are failed; attempts left
    /// queued never started and go back to the worker queue.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for attempt in self
            .storage
            .list_attempts_in_status(AttemptStatus::Running)
            .await?
        {
            let interrupted = self
                .lifecycle
                .finish(
                    &attempt.id,
                    Outcome::Failed {
                        exit_code: None,
                        code: ExecutionErrorCode::RunnerError,
                        message: "interrupted by daemon restart".to_string(),
                        detail: None,
                        cost_usd: None,
                    },
                )
                .await?;
            if let Some(finished) = interrupted {
                report.interrupted += 1;
                if self.config.cleanup_on_failure {
                    self.schedule_teardown(&finished);
                }
            }
        }

        for attempt in self
            .storage
            .list_attempts_in_status(AttemptStatus::Queued)
            .await?
        {
            if self.queue.push(attempt.id.clone()) {
                report.requeued += 1;
            }
        }

        for run in self.storage.list_running_runs().await? {
            self.on_slot_free(&run.id).await?;
            self.runs.refresh(&run.id).await?;
            report.runs_resumed += 1;
        }

        if report != RecoveryReport::default() {
            info!(
                interrupted = report.interrupted,
                requeued = report.requeued,
                runs = report.runs_resumed,
                "recovered state from previous process"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::*;
    use crate::testing::{harness, wait_until, STUBBORN_STOP};
    use crew_core::TaskStatus;

    #[tokio::test]
    async fn max_parallel_below_one_is_invalid() {
        let h = harness().await;
        let task = h.task("ok").await;
        let err = h
            .scheduler
            .start_run(&h.project.id, Some(&[task.id]), Some(0))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIG");
    }

    #[tokio::test]
    async fn no_admissible_task_is_invalid() {
        let h = harness().await;
        let done = seed_task(&h.ts.storage, &h.project, TaskStatus::Done).await;
        let err = h
            .scheduler
            .start_run(&h.project.id, Some(&[done.id, Id::new()]), Some(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidConfig(_)));
        assert!(h.ts.storage.latest_run(&h.project.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_project_is_not_found() {
        let h = harness().await;
        let err = h
            .scheduler
            .start_run(&Id::new(), None, Some(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn admits_fifo_up_to_max_parallel() {
        let h = harness().await;
        let t1 = h.task("block").await;
        let t2 = h.task("block").await;
        let t3 = h.task("ok").await;

        let run = h
            .scheduler
            .start_run(
                &h.project.id,
                Some(&[t1.id.clone(), t2.id.clone(), t3.id.clone()]),
                Some(2),
            )
            .await
            .unwrap();
        assert_eq!(run.counts.occupied(), 2);
        assert_eq!(run.counts.pending, 1);

        let attempts = h.ts.storage.list_attempts(&run.id).await.unwrap();
        assert_eq!(attempts[2].task_id, t3.id);
        assert_eq!(attempts[2].status, AttemptStatus::Pending);

        // Free one slot: t3 is admitted.
        h.runner.release_one();
        let storage = h.ts.storage.clone();
        let third = attempts[2].id.clone();
        wait_until(|| {
            let storage = storage.clone();
            let third = third.clone();
            async move { storage.get_attempt(&third).await.unwrap().status != AttemptStatus::Pending }
        })
        .await;

        h.runner.release_all();
        let run_id = run.id.clone();
        wait_until(|| {
            let storage = storage.clone();
            let run_id = run_id.clone();
            async move { storage.get_run(&run_id).await.unwrap().status == RunStatus::Completed }
        })
        .await;
        assert!(h.runner.max_concurrent() <= 2);
    }

    #[tokio::test]
    async fn second_start_is_already_running() {
        let h = harness().await;
        let task = h.task("block").await;
        h.scheduler
            .start_run(&h.project.id, Some(&[task.id.clone()]), Some(1))
            .await
            .unwrap();
        let err = h
            .scheduler
            .start_run(&h.project.id, Some(&[task.id]), Some(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ALREADY_RUNNING");
        h.runner.release_all();
    }

    #[tokio::test]
    async fn open_pr_blocks_next_run() {
        let h = harness().await;
        let task = h.task("ok").await;
        let run = h
            .scheduler
            .start_run(&h.project.id, Some(&[task.id.clone()]), Some(1))
            .await
            .unwrap();
        let storage = h.ts.storage.clone();
        let run_id = run.id.clone();
        wait_until(|| {
            let storage = storage.clone();
            let run_id = run_id.clone();
            async move { storage.get_run(&run_id).await.unwrap().status == RunStatus::Completed }
        })
        .await;

        let attempt = &h.ts.storage.list_attempts(&run.id).await.unwrap()[0];
        h.ts.storage
            .record_pull_request(&attempt.id, 9, "https://github.com/acme/demo/pull/9")
            .await
            .unwrap();

        let err = h
            .scheduler
            .start_run(&h.project.id, None, Some(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::PreflightFailed {
                code: SafetyCode::OpenPrLimit,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn duplicate_task_ids_are_admitted_once() {
        let h = harness().await;
        let task = h.task("block").await;
        let run = h
            .scheduler
            .start_run(
                &h.project.id,
                Some(&[task.id.clone(), task.id.clone()]),
                Some(2),
            )
            .await
            .unwrap();
        assert_eq!(run.selected_task_ids, vec![task.id]);
        assert_eq!(run.counts.total(), 1);
        h.runner.release_all();
    }

    #[tokio::test]
    async fn stop_running_attempt_records_stop_and_schedules_cleanup() {
        let h = harness().await;
        let task = h.task("hang").await;
        let run = h
            .scheduler
            .start_run(&h.project.id, Some(&[task.id]), Some(1))
            .await
            .unwrap();
        let attempt_id = h.ts.storage.list_attempts(&run.id).await.unwrap()[0].id.clone();
        let runner = h.runner.clone();
        let live = attempt_id.clone();
        wait_until(|| {
            let runner = runner.clone();
            let live = live.clone();
            async move { runner.is_live(&live) }
        })
        .await;

        let stop = h.scheduler.stop_attempt(&attempt_id, None).await.unwrap();
        assert_eq!(stop.status, AttemptStatus::Stopped);
        assert!(stop.signalled);

        let attempt = h.ts.storage.get_attempt(&attempt_id).await.unwrap();
        assert_eq!(attempt.exit_code, Some(-1));
        assert!(attempt.finished_at.is_some());
        assert!(attempt.cleanup_status.is_some());

        let workspaces = h.workspaces.clone();
        wait_until(|| {
            let workspaces = workspaces.clone();
            async move { workspaces.destroyed() == 1 }
        })
        .await;

        // A second stop is a no-op.
        let again = h.scheduler.stop_attempt(&attempt_id, None).await.unwrap();
        assert_eq!(again.status, AttemptStatus::Stopped);

        // The only attempt stopped: the run completes without failures.
        let storage = h.ts.storage.clone();
        let run_id = run.id.clone();
        wait_until(|| {
            let storage = storage.clone();
            let run_id = run_id.clone();
            async move { storage.get_run(&run_id).await.unwrap().status == RunStatus::Completed }
        })
        .await;
    }

    #[tokio::test]
    async fn stop_unknown_attempt_is_not_found() {
        let h = harness().await;
        let err = h.scheduler.stop_attempt(&Id::new(), None).await.unwrap_err();
        assert!(matches!(err, SchedulerError::AttemptNotFound(_)));
    }

    #[tokio::test]
    async fn stop_run_cancels_everything_and_counts() {
        let h = harness().await;
        let t1 = h.task("hang").await;
        let t2 = h.task("stubborn").await;
        let t3 = h.task("ok").await;
        let run = h
            .scheduler
            .start_run(
                &h.project.id,
                Some(&[t1.id, t2.id, t3.id]),
                Some(2),
            )
            .await
            .unwrap();

        let runner = h.runner.clone();
        wait_until(|| {
            let runner = runner.clone();
            async move { runner.live_count() == 2 }
        })
        .await;

        let report = h
            .scheduler
            .stop_run(&run.id, Some("enough"))
            .await
            .unwrap();
        assert!(report.stopped);
        assert_eq!(report.cancelled_count, 2);
        assert_eq!(report.failed_to_cancel_count, 1);

        let stored = h.ts.storage.get_run(&run.id).await.unwrap();
        assert_eq!(stored.status, RunStatus::Cancelled);
        assert_eq!(stored.counts.stopped, 3);
        assert_eq!(stored.error.as_deref(), Some("enough"));

        // Stopping again is a no-op.
        let again = h.scheduler.stop_run(&run.id, None).await.unwrap();
        assert_eq!(again, StopReport::default());
        h.runner.release_all();
    }

    #[tokio::test]
    async fn stop_run_waits_for_unresponsive_agents_concurrently() {
        let h = harness().await;
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(h.task("stubborn").await.id);
        }
        let run = h
            .scheduler
            .start_run(&h.project.id, Some(ids.as_slice()), Some(3))
            .await
            .unwrap();

        let runner = h.runner.clone();
        wait_until(|| {
            let runner = runner.clone();
            async move { runner.live_count() == 3 }
        })
        .await;

        let started = std::time::Instant::now();
        let report = h.scheduler.stop_run(&run.id, None).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(report.failed_to_cancel_count, 3);
        assert!(
            elapsed < STUBBORN_STOP * 2,
            "stops ran one after another: {elapsed:?}"
        );
        h.runner.release_all();
    }

    #[tokio::test]
    async fn execution_failures_fail_the_run() {
        let h = harness().await;
        let fail = h.task("fail").await;
        let empty = h.task("empty").await;
        let timeout = h.task("timeout").await;
        let run = h
            .scheduler
            .start_run(
                &h.project.id,
                Some(&[fail.id, empty.id, timeout.id]),
                Some(3),
            )
            .await
            .unwrap();

        let storage = h.ts.storage.clone();
        let run_id = run.id.clone();
        wait_until(|| {
            let storage = storage.clone();
            let run_id = run_id.clone();
            async move { storage.get_run(&run_id).await.unwrap().status == RunStatus::Failed }
        })
        .await;

        let attempts = h.ts.storage.list_attempts(&run.id).await.unwrap();
        let codes: Vec<_> = attempts.iter().map(|a| a.error_code).collect();
        assert_eq!(
            codes,
            vec![
                Some(ExecutionErrorCode::RunnerError),
                Some(ExecutionErrorCode::EmptyDiff),
                Some(ExecutionErrorCode::Timeout),
            ]
        );
        assert_eq!(attempts[2].exit_code, Some(124));
        assert!(attempts.iter().all(|a| a.status == AttemptStatus::Failed));
    }

    #[tokio::test]
    async fn workspace_failure_is_git_error() {
        let h = harness().await;
        h.workspaces.fail_creates(true);
        let task = h.task("ok").await;
        let run = h
            .scheduler
            .start_run(&h.project.id, Some(&[task.id]), Some(1))
            .await
            .unwrap();

        let storage = h.ts.storage.clone();
        let run_id = run.id.clone();
        wait_until(|| {
            let storage = storage.clone();
            let run_id = run_id.clone();
            async move { storage.get_run(&run_id).await.unwrap().status == RunStatus::Failed }
        })
        .await;
        let attempt = &h.ts.storage.list_attempts(&run.id).await.unwrap()[0];
        assert_eq!(attempt.error_code, Some(ExecutionErrorCode::GitError));
    }

    #[tokio::test]
    async fn recover_fails_running_and_requeues_queued() {
        let h = harness().await;
        let t1 = h.task("ok").await;
        let t2 = h.task("ok").await;
        let t3 = h.task("ok").await;
        let (run, attempts) = seed_run(
            &h.ts.storage,
            &h.project,
            &[t1, t2, t3],
            2,
        )
        .await;
        // Simulate a previous process: one running, one queued, one pending.
        let storage = &h.ts.storage;
        storage.advance_attempt(&attempts[0].id, AttemptStatus::Queued).await.unwrap();
        storage.advance_attempt(&attempts[0].id, AttemptStatus::Running).await.unwrap();
        storage.advance_attempt(&attempts[1].id, AttemptStatus::Queued).await.unwrap();

        let report = h.scheduler.recover().await.unwrap();
        assert_eq!(report.interrupted, 1);
        assert_eq!(report.requeued, 1);
        assert_eq!(report.runs_resumed, 1);

        let first = storage.get_attempt(&attempts[0].id).await.unwrap();
        assert_eq!(first.status, AttemptStatus::Failed);
        assert_eq!(
            first.error_message.as_deref(),
            Some("interrupted by daemon restart")
        );

        let storage = storage.clone();
        let run_id = run.id.clone();
        wait_until(|| {
            let storage = storage.clone();
            let run_id = run_id.clone();
            async move { storage.get_run(&run_id).await.unwrap().status == RunStatus::Failed }
        })
        .await;
        let counts = h.ts.storage.run_counts(&run.id).await.unwrap();
        assert_eq!(counts.completed, 2);
        assert_eq!(counts.failed, 1);
    }
}
