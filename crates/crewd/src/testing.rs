//! In-process fixtures for scheduler and worker tests.
//!
//! `ScriptedRunner` picks its behavior from the first line of the prompt
//! (the task title): `ok`, `empty`, `fail`, `timeout`, `crash`, `block`,
//! `stubborn` or `hang`.

use async_trait::async_trait;
use chrono::Utc;
use crew_core::{AttemptWorkspace, Id, Project, Task, TaskStatus};
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::gc::WorkspaceCollector;
use crate::git::GitError;
use crate::lifecycle::AttemptLifecycle;
use crate::run_lifecycle::RunLifecycle;
use crate::runner::{self, AgentOutput, AgentRequest, AgentRunner, RunnerError};
use crate::safety::{SafetyGate, SafetyPolicy, StorageCostLedger};
use crate::scheduler::{Scheduler, SchedulerConfig, SchedulerParts};
use crate::storage::test_support::{create_test_storage, seed_project, TestStorage};
use crate::worker::{Worker, WorkerQueue};
use crate::workspace::{
    self, ApplyOutcome, TeardownError, TeardownReport, WorkspaceError, WorkspaceManager,
};

/// How long a `stubborn` agent ignores a stop before it is reported unconfirmed.
pub const STUBBORN_STOP: Duration = Duration::from_millis(500);

struct LiveEntry {
    cancel: CancellationToken,
    stubborn: bool,
}

pub struct ScriptedRunner {
    gate: Semaphore,
    live: Mutex<HashMap<Id, LiveEntry>>,
    current: AtomicUsize,
    max: AtomicUsize,
    started: AtomicUsize,
}

impl std::fmt::Debug for ScriptedRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedRunner").finish_non_exhaustive()
    }
}

impl ScriptedRunner {
    fn new() -> Self {
        Self {
            gate: Semaphore::new(0),
            live: Mutex::new(HashMap::new()),
            current: AtomicUsize::new(0),
            max: AtomicUsize::new(0),
            started: AtomicUsize::new(0),
        }
    }

    /// Let one blocked agent finish.
    pub fn release_one(&self) {
        self.gate.add_permits(1);
    }

    pub fn release_all(&self) {
        self.gate.add_permits(1024);
    }

    pub fn max_concurrent(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    /// Number of `run` calls so far.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_live(&self, attempt_id: &Id) -> bool {
        self.live.lock().unwrap().contains_key(attempt_id)
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    fn register(&self, attempt_id: &Id, stubborn: bool) -> CancellationToken {
        let cancel = CancellationToken::new();
        self.live.lock().unwrap().insert(
            attempt_id.clone(),
            LiveEntry {
                cancel: cancel.clone(),
                stubborn,
            },
        );
        cancel
    }

    async fn script(&self, request: &AgentRequest) -> runner::Result<AgentOutput> {
        let mode = request.prompt.lines().next().unwrap_or_default();
        match mode {
            "ok" => Ok(write_change(request)),
            "empty" => Ok(AgentOutput::default()),
            "fail" => Ok(AgentOutput {
                exit_code: 2,
                output: "boom".to_string(),
                ..AgentOutput::default()
            }),
            "timeout" => Err(RunnerError::Timeout(5)),
            "crash" => Err(RunnerError::CommandNotFound("agent".to_string())),
            "hang" => {
                self.register(&request.attempt_id, false).cancelled().await;
                Err(RunnerError::Cancelled)
            }
            "block" | "stubborn" => {
                let cancel = self.register(&request.attempt_id, mode == "stubborn");
                tokio::select! {
                    permit = self.gate.acquire() => {
                        permit.unwrap().forget();
                        Ok(write_change(request))
                    }
                    () = cancel.cancelled() => Err(RunnerError::Cancelled),
                }
            }
            other => panic!("unknown script {other:?}"),
        }
    }
}

fn write_change(request: &AgentRequest) -> AgentOutput {
    std::fs::write(request.workspace_path.join("change.txt"), "changed\n").unwrap();
    AgentOutput {
        exit_code: 0,
        output: "made the change".to_string(),
        cost_usd: Some(0.25),
        duration_ms: 1,
    }
}

#[async_trait]
impl AgentRunner for ScriptedRunner {
    async fn run(&self, request: &AgentRequest) -> runner::Result<AgentOutput> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);

        let result = self.script(request).await;

        self.live.lock().unwrap().remove(&request.attempt_id);
        self.current.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn stop(&self, attempt_id: &Id) -> runner::Result<()> {
        let stubborn = {
            let live = self.live.lock().unwrap();
            match live.get(attempt_id) {
                Some(entry) if entry.stubborn => true,
                Some(entry) => {
                    entry.cancel.cancel();
                    false
                }
                None => false,
            }
        };
        if stubborn {
            tokio::time::sleep(STUBBORN_STOP).await;
            return Err(RunnerError::StopTimeout(1));
        }
        Ok(())
    }
}

/// Plain directories instead of git worktrees; the diff lists file names.
#[derive(Debug)]
pub struct FakeWorkspaces {
    root: TempDir,
    fail_creates: AtomicBool,
    destroyed: AtomicUsize,
}

impl FakeWorkspaces {
    fn new() -> Self {
        Self {
            root: TempDir::new().unwrap(),
            fail_creates: AtomicBool::new(false),
            destroyed: AtomicUsize::new(0),
        }
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkspaceManager for FakeWorkspaces {
    async fn create(
        &self,
        _project: &Project,
        attempt_id: &Id,
        base_branch: &str,
    ) -> workspace::Result<AttemptWorkspace> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(WorkspaceError::Git(GitError::CommandFailed(
                "worktree add refused".to_string(),
            )));
        }
        let path = self.root.path().join(attempt_id.as_ref());
        std::fs::create_dir_all(&path).unwrap();
        Ok(AttemptWorkspace {
            path: path.to_string_lossy().to_string(),
            branch_name: format!("crew/{attempt_id}"),
            base_branch: base_branch.to_string(),
            base_commit: "0000000".to_string(),
        })
    }

    async fn diff(&self, workspace: &AttemptWorkspace) -> workspace::Result<String> {
        let mut names: Vec<String> = std::fs::read_dir(&workspace.path)
            .map_err(|e| WorkspaceError::Git(GitError::Execution(e)))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        Ok(names.iter().map(|n| format!("+++ b/{n}\n")).collect())
    }

    async fn destroy(
        &self,
        _project: &Project,
        workspace: &AttemptWorkspace,
    ) -> Result<TeardownReport, TeardownError> {
        let existed = Path::new(&workspace.path).exists();
        if existed {
            std::fs::remove_dir_all(&workspace.path).unwrap();
        }
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(TeardownReport {
            removed_worktree: existed,
            removed_branch: existed,
            removed_dir: existed,
        })
    }

    async fn apply(
        &self,
        _project: &Project,
        _attempt_id: &Id,
        _workspace: &AttemptWorkspace,
    ) -> workspace::Result<ApplyOutcome> {
        Ok(ApplyOutcome::Applied)
    }
}

/// A scheduler wired to scripted collaborators with a live worker pump.
pub struct Harness {
    pub ts: TestStorage,
    pub project: Project,
    pub scheduler: Arc<Scheduler>,
    pub runner: Arc<ScriptedRunner>,
    pub workspaces: Arc<FakeWorkspaces>,
    pub collector: Arc<WorkspaceCollector>,
    shutdown: CancellationToken,
    _repo: TempDir,
}

impl Harness {
    /// Insert a todo task; the title selects the runner script.
    pub async fn task(&self, title: &str) -> Task {
        let now = Utc::now();
        let task = Task {
            id: Id::new(),
            project_id: self.project.id.clone(),
            title: title.to_string(),
            description: None,
            status: TaskStatus::Todo,
            created_at: now,
            updated_at: now,
        };
        self.ts.storage.insert_task(&task).await.unwrap();
        task
    }

    /// A worker sharing the harness collaborators, outside the pump.
    pub fn worker(&self) -> Worker {
        Worker::new(
            self.ts.storage.clone(),
            self.workspaces.clone(),
            self.runner.clone(),
            self.scheduler.clone(),
        )
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.runner.release_all();
    }
}

pub async fn harness() -> Harness {
    let ts = create_test_storage().await;
    let repo = TempDir::new().unwrap();
    std::fs::create_dir(repo.path().join(".git")).unwrap();
    let project = seed_project(&ts.storage, &repo.path().to_string_lossy()).await;

    let storage = ts.storage.clone();
    let runner = Arc::new(ScriptedRunner::new());
    let workspaces = Arc::new(FakeWorkspaces::new());
    let collector = Arc::new(WorkspaceCollector::new(storage.clone(), workspaces.clone()));
    let (queue, receiver) = WorkerQueue::channel();

    let parts = SchedulerParts {
        storage: storage.clone(),
        tasks: storage.clone(),
        gate: Arc::new(SafetyGate::new(
            storage.clone(),
            Arc::new(StorageCostLedger::new(storage.clone(), None)),
            SafetyPolicy {
                bypass: false,
                open_pr_limit: 1,
            },
        )),
        lifecycle: Arc::new(AttemptLifecycle::new(storage.clone(), storage.clone())),
        runs: Arc::new(RunLifecycle::new(storage.clone())),
        runner: runner.clone(),
        collector: collector.clone(),
        queue,
    };
    let scheduler = Arc::new(Scheduler::new(
        parts,
        SchedulerConfig {
            default_max_parallel: 1,
            cleanup_on_failure: true,
        },
    ));

    let shutdown = CancellationToken::new();
    let worker = Arc::new(Worker::new(
        storage,
        workspaces.clone(),
        runner.clone(),
        scheduler.clone(),
    ));
    worker.spawn(receiver, shutdown.clone());

    Harness {
        ts,
        project,
        scheduler,
        runner,
        workspaces,
        collector,
        shutdown,
        _repo: repo,
    }
}

/// Poll `check` until it holds, panicking after a few seconds.
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
