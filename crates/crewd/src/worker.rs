//! Worker queue: dispatches admitted attempts for execution.
//!
//! The pump pops attempt ids in admission order and runs each one out of
//! line. Execution never fails outward: every error is captured on the
//! attempt as a terminal status.

use crew_core::{Attempt, ExecutionErrorCode, Id, Task, TIMEOUT_EXIT_CODE};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::lifecycle::{AttemptLifecycle, Outcome};
use crate::runner::{AgentRequest, AgentRunner, RunnerError};
use crate::scheduler::Scheduler;
use crate::storage::{Storage, StorageError};
use crate::workspace::WorkspaceManager;

/// Sending half of the worker queue.
#[derive(Debug, Clone)]
pub struct WorkerQueue {
    tx: mpsc::UnboundedSender<Id>,
}

/// Receiving half of the worker queue, consumed by [`Worker::spawn`].
#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::UnboundedReceiver<Id>,
}

impl WorkerQueue {
    pub fn channel() -> (Self, QueueReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, QueueReceiver { rx })
    }

    /// Enqueue an admitted attempt. Returns false once the worker is gone.
    pub fn push(&self, attempt_id: Id) -> bool {
        self.tx.send(attempt_id).is_ok()
    }
}

pub struct Worker {
    storage: Arc<Storage>,
    lifecycle: Arc<AttemptLifecycle>,
    workspaces: Arc<dyn WorkspaceManager>,
    runner: Arc<dyn AgentRunner>,
    scheduler: Arc<Scheduler>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker").finish_non_exhaustive()
    }
}

impl Worker {
    pub fn new(
        storage: Arc<Storage>,
        workspaces: Arc<dyn WorkspaceManager>,
        runner: Arc<dyn AgentRunner>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            storage,
            lifecycle: Arc::clone(scheduler.lifecycle()),
            workspaces,
            runner,
            scheduler,
        }
    }

    /// Pump the queue until `shutdown` fires or every sender is dropped.
    pub fn spawn(self: Arc<Self>, receiver: QueueReceiver, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut rx = receiver.rx;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    next = rx.recv() => {
                        let Some(attempt_id) = next else { break };
                        debug!(attempt_id = %attempt_id, "dispatching attempt");
                        let worker = Arc::clone(&self);
                        tokio::spawn(async move { worker.execute(&attempt_id).await });
                    }
                }
            }
            debug!("worker queue stopped");
        })
    }

    /// Drive one queued attempt to a terminal status.
    pub async fn execute(&self, attempt_id: &Id) {
        match self.try_execute(attempt_id).await {
            Ok(Some(finished)) => self.scheduler.attempt_finished(&finished).await,
            Ok(None) => {}
            Err(e) => {
                error!(attempt_id = %attempt_id, error = %e, "attempt execution failed");
                let outcome = Outcome::Failed {
                    exit_code: None,
                    code: ExecutionErrorCode::RunnerError,
                    message: e.to_string(),
                    detail: None,
                    cost_usd: None,
                };
                match self.lifecycle.finish(attempt_id, outcome).await {
                    Ok(Some(finished)) => self.scheduler.attempt_finished(&finished).await,
                    Ok(None) => {}
                    Err(e) => {
                        error!(attempt_id = %attempt_id, error = %e, "could not record attempt failure");
                    }
                }
            }
        }
    }

    /// Returns the attempt if this worker's terminal write took effect.
    async fn try_execute(&self, attempt_id: &Id) -> Result<Option<Attempt>, StorageError> {
        let attempt = self.storage.get_attempt(attempt_id).await?;
        if !self.lifecycle.mark_running(&attempt).await? {
            return Ok(None);
        }

        let Some(outcome) = self.produce_outcome(&attempt).await? else {
            return Ok(None);
        };
        self.lifecycle.finish(&attempt.id, outcome).await
    }

    /// Create the workspace, run the agent and classify the result.
    ///
    /// `None` means the attempt was stopped before the agent launched.
    async fn produce_outcome(&self, attempt: &Attempt) -> Result<Option<Outcome>, StorageError> {
        let project = self.storage.get_project(&attempt.project_id).await?;
        let task = self.storage.get_task(&attempt.task_id).await?;

        let workspace = match self
            .workspaces
            .create(&project, &attempt.id, &project.default_branch)
            .await
        {
            Ok(workspace) => workspace,
            Err(e) => {
                return Ok(Some(Outcome::Failed {
                    exit_code: None,
                    code: ExecutionErrorCode::GitError,
                    message: format!("workspace creation failed: {e}"),
                    detail: None,
                    cost_usd: None,
                }))
            }
        };
        self.lifecycle.attach_workspace(attempt, &workspace).await?;

        // A stop may have landed while the workspace was being created.
        let current = self.storage.get_attempt(&attempt.id).await?;
        if current.status.is_terminal() {
            info!(attempt_id = %attempt.id, "attempt stopped before agent launch");
            self.scheduler.schedule_teardown(&current);
            return Ok(None);
        }

        let request = AgentRequest {
            attempt_id: attempt.id.clone(),
            task_id: attempt.task_id.clone(),
            project_id: attempt.project_id.clone(),
            workspace_path: PathBuf::from(&workspace.path),
            prompt: task_prompt(&task),
        };

        let outcome = match self.runner.run(&request).await {
            Ok(output) if output.exit_code == 0 => match self.workspaces.diff(&workspace).await {
                Ok(diff) if diff.trim().is_empty() => Outcome::Failed {
                    exit_code: Some(0),
                    code: ExecutionErrorCode::EmptyDiff,
                    message: "agent exited cleanly but produced no changes".to_string(),
                    detail: Some(output.output),
                    cost_usd: output.cost_usd,
                },
                Ok(diff) => Outcome::Completed {
                    diff,
                    summary: output.output,
                    cost_usd: output.cost_usd,
                },
                Err(e) => Outcome::Failed {
                    exit_code: Some(0),
                    code: ExecutionErrorCode::GitError,
                    message: format!("failed to collect diff: {e}"),
                    detail: Some(output.output),
                    cost_usd: output.cost_usd,
                },
            },
            Ok(output) => Outcome::Failed {
                exit_code: Some(output.exit_code),
                code: ExecutionErrorCode::RunnerError,
                message: format!("agent exited with code {}", output.exit_code),
                detail: Some(output.output),
                cost_usd: output.cost_usd,
            },
            Err(RunnerError::Timeout(secs)) => Outcome::Failed {
                exit_code: Some(TIMEOUT_EXIT_CODE),
                code: ExecutionErrorCode::Timeout,
                message: format!("agent timeout after {secs}s"),
                detail: None,
                cost_usd: None,
            },
            Err(RunnerError::Cancelled) => Outcome::Stopped {
                reason: "agent cancelled".to_string(),
            },
            Err(e) => {
                warn!(attempt_id = %attempt.id, error = %e, "agent run failed");
                Outcome::Failed {
                    exit_code: None,
                    code: ExecutionErrorCode::RunnerError,
                    message: e.to_string(),
                    detail: None,
                    cost_usd: None,
                }
            }
        };
        Ok(Some(outcome))
    }
}

/// Agent prompt for a task: its title, then the description if any.
fn task_prompt(task: &Task) -> String {
    match task.description.as_deref().map(str::trim) {
        Some(description) if !description.is_empty() => {
            format!("{}\n\n{description}", task.title)
        }
        _ => task.title.clone(),
    }
}
