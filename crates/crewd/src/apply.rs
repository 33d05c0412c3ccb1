//! Apply a completed attempt's branch onto the project's base branch.

use crew_core::{AttemptStatus, CleanupStatus, Id, MergeStatus};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::storage::{Storage, StorageError};
use crate::workspace::{ApplyOutcome, WorkspaceManager};

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("attempt not found: {0}")]
    AttemptNotFound(String),
    #[error("attempt {0} is not completed")]
    NotCompleted(String),
    #[error("attempt {0} has no workspace to apply")]
    NoWorkspace(String),
}

impl ApplyError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Storage(_) => "INTERNAL",
            Self::AttemptNotFound(_) => "NOT_FOUND",
            Self::NotCompleted(_) | Self::NoWorkspace(_) => "INVALID_STATE",
        }
    }
}

pub type Result<T> = std::result::Result<T, ApplyError>;

/// Merge result as recorded on the attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub merge_status: MergeStatus,
    pub conflict_files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apply_error: Option<String>,
}

pub struct ApplyService {
    storage: Arc<Storage>,
    workspaces: Arc<dyn WorkspaceManager>,
}

impl std::fmt::Debug for ApplyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplyService").finish_non_exhaustive()
    }
}

impl ApplyService {
    pub fn new(storage: Arc<Storage>, workspaces: Arc<dyn WorkspaceManager>) -> Self {
        Self {
            storage,
            workspaces,
        }
    }

    /// Merge the attempt branch into its base branch in the primary checkout.
    ///
    /// Merge conflicts and git failures are recorded on the attempt and
    /// reported, not returned as errors.
    pub async fn apply_attempt(&self, attempt_id: &Id) -> Result<ApplyReport> {
        let attempt = match self.storage.get_attempt(attempt_id).await {
            Ok(attempt) => attempt,
            Err(StorageError::AttemptNotFound(id)) => return Err(ApplyError::AttemptNotFound(id)),
            Err(e) => return Err(e.into()),
        };
        if attempt.status != AttemptStatus::Completed {
            return Err(ApplyError::NotCompleted(attempt_id.to_string()));
        }
        let workspace = match &attempt.workspace {
            Some(ws) if attempt.cleanup_status != Some(CleanupStatus::Cleaned) => ws,
            _ => return Err(ApplyError::NoWorkspace(attempt_id.to_string())),
        };
        let project = self.storage.get_project(&attempt.project_id).await?;

        let report = match self.workspaces.apply(&project, attempt_id, workspace).await {
            Ok(ApplyOutcome::Applied) => ApplyReport {
                merge_status: MergeStatus::Applied,
                conflict_files: Vec::new(),
                apply_error: None,
            },
            Ok(ApplyOutcome::Conflict(files)) => ApplyReport {
                merge_status: MergeStatus::Conflict,
                conflict_files: files,
                apply_error: None,
            },
            Err(e) => ApplyReport {
                merge_status: MergeStatus::Failed,
                conflict_files: Vec::new(),
                apply_error: Some(e.to_string()),
            },
        };

        self.storage
            .set_merge_result(
                attempt_id,
                report.merge_status,
                &report.conflict_files,
                report.apply_error.as_deref(),
            )
            .await?;

        match report.merge_status {
            MergeStatus::Applied => info!(
                attempt_id = %attempt_id,
                branch = %workspace.branch_name,
                base = %workspace.base_branch,
                "attempt applied"
            ),
            _ => warn!(
                attempt_id = %attempt_id,
                status = report.merge_status.as_str(),
                conflicts = report.conflict_files.len(),
                error = report.apply_error.as_deref().unwrap_or(""),
                "attempt not applied"
            ),
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_support::{git_ok, setup_test_repo};
    use crate::storage::test_support::*;
    use crate::storage::Termination;
    use crate::workspace::GitWorkspaceManager;
    use crew_core::{Attempt, Config, TaskStatus};
    use std::path::Path;
    use tempfile::TempDir;

    struct Fixture {
        ts: TestStorage,
        repo: TempDir,
        _root: TempDir,
        manager: Arc<GitWorkspaceManager>,
        service: ApplyService,
    }

    async fn fixture() -> Fixture {
        let ts = create_test_storage().await;
        let repo = setup_test_repo();
        let root = TempDir::new().unwrap();
        let manager = Arc::new(GitWorkspaceManager::new(Config {
            worktree_root: root.path().to_path_buf(),
            ..Config::default()
        }));
        let service = ApplyService::new(ts.storage.clone(), manager.clone());
        Fixture {
            ts,
            repo,
            _root: root,
            manager,
            service,
        }
    }

    /// An attempt that wrote `content` to `file` in its workspace.
    async fn attempt_writing(fx: &Fixture, status: AttemptStatus, file: &str, content: &str) -> Attempt {
        let storage = &fx.ts.storage;
        let project = seed_project(storage, &fx.repo.path().to_string_lossy()).await;
        let task = seed_task(storage, &project, TaskStatus::Todo).await;
        let (_, attempts) = seed_run(storage, &project, &[task], 1).await;
        let id = &attempts[0].id;
        storage.advance_attempt(id, AttemptStatus::Queued).await.unwrap();
        storage.advance_attempt(id, AttemptStatus::Running).await.unwrap();
        let ws = fx.manager.create(&project, id, "main").await.unwrap();
        std::fs::write(Path::new(&ws.path).join(file), content).unwrap();
        storage.set_attempt_workspace(id, &ws).await.unwrap();
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
        storage.get_attempt(id).await.unwrap()
    }

    #[tokio::test]
    async fn applies_completed_attempt() {
        let fx = fixture().await;
        let attempt = attempt_writing(&fx, AttemptStatus::Completed, "feature.txt", "done\n").await;

        let report = fx.service.apply_attempt(&attempt.id).await.unwrap();
        assert_eq!(report.merge_status, MergeStatus::Applied);
        assert!(fx.repo.path().join("feature.txt").exists());

        let stored = fx.ts.storage.get_attempt(&attempt.id).await.unwrap();
        assert_eq!(stored.merge_status, Some(MergeStatus::Applied));
    }

    #[tokio::test]
    async fn conflict_is_recorded_with_files() {
        let fx = fixture().await;
        let attempt = attempt_writing(&fx, AttemptStatus::Completed, "README.md", "theirs\n").await;
        std::fs::write(fx.repo.path().join("README.md"), "ours\n").unwrap();
        git_ok(fx.repo.path(), &["commit", "-am", "diverge"]);

        let report = fx.service.apply_attempt(&attempt.id).await.unwrap();
        assert_eq!(report.merge_status, MergeStatus::Conflict);
        assert_eq!(report.conflict_files, vec!["README.md".to_string()]);

        let stored = fx.ts.storage.get_attempt(&attempt.id).await.unwrap();
        assert_eq!(stored.merge_status, Some(MergeStatus::Conflict));
        assert_eq!(stored.conflict_files, vec!["README.md".to_string()]);
    }

    #[tokio::test]
    async fn failed_attempt_cannot_be_applied() {
        let fx = fixture().await;
        let attempt = attempt_writing(&fx, AttemptStatus::Failed, "x.txt", "x\n").await;
        let err = fx.service.apply_attempt(&attempt.id).await.unwrap_err();
        assert!(matches!(err, ApplyError::NotCompleted(_)));

        let err = fx.service.apply_attempt(&Id::new()).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }
}
