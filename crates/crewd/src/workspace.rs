//! Workspace manager: one git worktree + branch per attempt.
//!
//! Workspaces live at `{worktree_root}/{repo}/{attempt_id}` on branch
//! `{branch_prefix}{attempt_id}`, forked from the resolved base commit.

use async_trait::async_trait;
use crew_core::{AttemptWorkspace, Config, Id, Project};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::git::{self, MergeOutcome};

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("git error: {0}")]
    Git(#[from] git::GitError),
    #[error("primary checkout has uncommitted changes: {0}")]
    DirtyCheckout(String),
    #[error("workspace task failed: {0}")]
    Join(String),
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

/// Teardown step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownStep {
    Worktree,
    Dir,
}

#[derive(Debug, Error)]
#[error("teardown failed at {step:?}: {message}")]
pub struct TeardownError {
    pub step: TeardownStep,
    pub message: String,
}

/// What a teardown pass actually removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub removed_worktree: bool,
    pub removed_branch: bool,
    pub removed_dir: bool,
}

/// Outcome of merging an attempt branch into the project's base branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Conflict(Vec<String>),
}

#[async_trait]
pub trait WorkspaceManager: Send + Sync {
    /// Create an isolated worktree for `attempt_id` forked from `base_branch`.
    async fn create(
        &self,
        project: &Project,
        attempt_id: &Id,
        base_branch: &str,
    ) -> Result<AttemptWorkspace>;

    /// Everything the attempt changed relative to its base commit.
    async fn diff(&self, workspace: &AttemptWorkspace) -> Result<String>;

    /// Idempotent teardown: worktree, then branch, then directory.
    async fn destroy(
        &self,
        project: &Project,
        workspace: &AttemptWorkspace,
    ) -> std::result::Result<TeardownReport, TeardownError>;

    /// Commit the attempt's changes and merge its branch into the base branch.
    async fn apply(
        &self,
        project: &Project,
        attempt_id: &Id,
        workspace: &AttemptWorkspace,
    ) -> Result<ApplyOutcome>;
}

/// Workspace manager backed by native git worktrees.
#[derive(Debug, Clone)]
pub struct GitWorkspaceManager {
    config: Config,
}

impl GitWorkspaceManager {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn branch_name(&self, attempt_id: &Id) -> String {
        format!("{}{}", self.config.branch_prefix, attempt_id)
    }

    pub fn worktree_path(&self, project: &Project, attempt_id: &Id) -> PathBuf {
        self.config
            .worktree_root
            .join(git::repo_name(Path::new(&project.repo_path)))
            .join(attempt_id.as_ref())
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| WorkspaceError::Join(e.to_string()))?
}

#[async_trait]
impl WorkspaceManager for GitWorkspaceManager {
    async fn create(
        &self,
        project: &Project,
        attempt_id: &Id,
        base_branch: &str,
    ) -> Result<AttemptWorkspace> {
        let repo = PathBuf::from(&project.repo_path);
        let path = self.worktree_path(project, attempt_id);
        let branch = self.branch_name(attempt_id);
        let base = base_branch.to_string();

        let workspace = blocking(move || {
            let base_commit = git::rev_parse(&repo, &base)?;
            git::create_worktree(&repo, &path, &branch, &base_commit)?;
            Ok(AttemptWorkspace {
                path: path.to_string_lossy().into_owned(),
                branch_name: branch,
                base_branch: base,
                base_commit,
            })
        })
        .await?;

        info!(
            attempt_id = %attempt_id,
            path = %workspace.path,
            branch = %workspace.branch_name,
            "workspace created"
        );
        Ok(workspace)
    }

    async fn diff(&self, workspace: &AttemptWorkspace) -> Result<String> {
        let path = PathBuf::from(&workspace.path);
        let base = workspace.base_commit.clone();
        blocking(move || Ok(git::diff_against(&path, &base)?)).await
    }

    async fn destroy(
        &self,
        project: &Project,
        workspace: &AttemptWorkspace,
    ) -> std::result::Result<TeardownReport, TeardownError> {
        let repo = PathBuf::from(&project.repo_path);
        let path = PathBuf::from(&workspace.path);
        let branch = workspace.branch_name.clone();
        let protected = self
            .config
            .is_protected_branch(&branch, &project.default_branch);

        let report = tokio::task::spawn_blocking(move || teardown(&repo, &path, &branch, protected))
            .await
            .map_err(|e| TeardownError {
                step: TeardownStep::Worktree,
                message: e.to_string(),
            })??;

        debug!(path = %workspace.path, ?report, "workspace teardown finished");
        Ok(report)
    }

    async fn apply(
        &self,
        project: &Project,
        attempt_id: &Id,
        workspace: &AttemptWorkspace,
    ) -> Result<ApplyOutcome> {
        let repo = PathBuf::from(&project.repo_path);
        let path = PathBuf::from(&workspace.path);
        let branch = workspace.branch_name.clone();
        let base = workspace.base_branch.clone();
        let message = format!("crew: apply attempt {attempt_id}");

        blocking(move || {
            if path.exists() {
                git::commit_all(&path, &message)?;
            }
            if !git::is_working_tree_clean(&repo)? {
                return Err(WorkspaceError::DirtyCheckout(repo.display().to_string()));
            }
            if git::current_branch(&repo)? != base {
                git::checkout_branch(&repo, &base)?;
            }
            Ok(match git::merge_branch(&repo, &branch)? {
                MergeOutcome::Merged => ApplyOutcome::Applied,
                MergeOutcome::Conflict(files) => ApplyOutcome::Conflict(files),
            })
        })
        .await
    }
}

fn teardown(
    repo: &Path,
    path: &Path,
    branch: &str,
    protected: bool,
) -> std::result::Result<TeardownReport, TeardownError> {
    let mut report = TeardownReport::default();

    // 1. Worktree. A failure here aborts the remaining steps.
    let registered = git::is_registered_worktree(repo, path).map_err(|e| TeardownError {
        step: TeardownStep::Worktree,
        message: e.to_string(),
    })?;
    if registered {
        git::remove_worktree_force(repo, path).map_err(|e| TeardownError {
            step: TeardownStep::Worktree,
            message: e.to_string(),
        })?;
        report.removed_worktree = true;
    } else if let Err(e) = git::prune_worktrees(repo) {
        debug!(error = %e, "worktree prune failed");
    }

    // 2. Branch. Never fatal.
    if !protected {
        match git::branch_exists(repo, branch) {
            Ok(true) => match git::delete_branch(repo, branch) {
                Ok(()) => report.removed_branch = true,
                Err(e) => warn!(branch, error = %e, "branch delete failed"),
            },
            Ok(false) => {}
            Err(e) => warn!(branch, error = %e, "branch lookup failed"),
        }
    }

    // 3. Directory.
    if path.exists() {
        std::fs::remove_dir_all(path).map_err(|e| TeardownError {
            step: TeardownStep::Dir,
            message: e.to_string(),
        })?;
        report.removed_dir = true;
    }

    Ok(report)
}
