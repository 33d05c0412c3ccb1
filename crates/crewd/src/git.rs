//! Git operations for attempt workspaces.
//!
//! Thin wrappers over the `git` CLI. Every function is blocking; async
//! callers go through `spawn_blocking`.

use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Outcome of merging a branch into the checked-out branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    /// Merge stopped on conflicts and was aborted; lists the conflicting paths.
    Conflict(Vec<String>),
}

/// Run git in `dir` and return trimmed stdout, failing on a non-zero exit.
fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git").args(args).current_dir(dir).output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git {}: {}",
            args.join(" "),
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8(output.stdout).map_err(|_| GitError::InvalidUtf8)?;
    Ok(stdout.trim_end().to_string())
}

/// Get the repository directory name.
pub fn repo_name(repo_root: &Path) -> String {
    repo_root
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("repo")
        .to_string()
}

/// Resolve a revision to a full commit hash.
pub fn rev_parse(repo_root: &Path, rev: &str) -> Result<String> {
    git(repo_root, &["rev-parse", "--verify", &format!("{rev}^{{commit}}")])
}

/// Check if a branch exists locally.
pub fn branch_exists(repo_root: &Path, branch: &str) -> Result<bool> {
    let output = Command::new("git")
        .args(["rev-parse", "--verify", &format!("refs/heads/{branch}")])
        .current_dir(repo_root)
        .output()?;

    Ok(output.status.success())
}

pub fn current_branch(repo_root: &Path) -> Result<String> {
    git(repo_root, &["branch", "--show-current"])
}

/// Create a worktree at `worktree_path` on a new `branch` forked from `base`.
///
/// Reuses `branch` if it already exists.
pub fn create_worktree(
    repo_root: &Path,
    worktree_path: &Path,
    branch: &str,
    base: &str,
) -> Result<()> {
    if let Some(parent) = worktree_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            GitError::CommandFailed(format!("failed to create parent directory: {e}"))
        })?;
    }

    let path = worktree_path.to_string_lossy();
    if branch_exists(repo_root, branch)? {
        git(repo_root, &["worktree", "add", path.as_ref(), branch])?;
    } else {
        git(repo_root, &["worktree", "add", "-b", branch, path.as_ref(), base])?;
    }
    Ok(())
}

/// Force remove a git worktree (even with local changes).
pub fn remove_worktree_force(repo_root: &Path, worktree_path: &Path) -> Result<()> {
    git(
        repo_root,
        &[
            "worktree",
            "remove",
            "--force",
            worktree_path.to_string_lossy().as_ref(),
        ],
    )?;
    Ok(())
}

/// Drop administrative entries of worktrees whose directories are gone.
pub fn prune_worktrees(repo_root: &Path) -> Result<()> {
    git(repo_root, &["worktree", "prune"])?;
    Ok(())
}

/// Whether `worktree_path` is registered as a worktree of `repo_root`.
pub fn is_registered_worktree(repo_root: &Path, worktree_path: &Path) -> Result<bool> {
    let listing = git(repo_root, &["worktree", "list", "--porcelain"])?;
    let wanted = worktree_path
        .canonicalize()
        .unwrap_or_else(|_| worktree_path.to_path_buf());
    Ok(listing
        .lines()
        .filter_map(|line| line.strip_prefix("worktree "))
        .any(|p| {
            let p = Path::new(p);
            p == worktree_path || p.canonicalize().is_ok_and(|c| c == wanted)
        }))
}

/// Force delete a local branch.
pub fn delete_branch(repo_root: &Path, branch: &str) -> Result<()> {
    git(repo_root, &["branch", "-D", branch])?;
    Ok(())
}

/// Check if the working tree is clean (no uncommitted changes).
pub fn is_working_tree_clean(dir: &Path) -> Result<bool> {
    Ok(git(dir, &["status", "--porcelain"])?.trim().is_empty())
}

/// Checkout a branch in the workspace.
pub fn checkout_branch(repo_root: &Path, branch: &str) -> Result<()> {
    git(repo_root, &["checkout", branch])?;
    Ok(())
}

/// Diff of everything in the worktree (committed or not) against `base_commit`.
///
/// Stages all changes, including untracked files, so new files show up.
pub fn diff_against(worktree_path: &Path, base_commit: &str) -> Result<String> {
    git(worktree_path, &["add", "-A"])?;
    git(worktree_path, &["diff", "--cached", base_commit])
}

/// Commit all pending changes in `dir`. Returns false when there was nothing to commit.
pub fn commit_all(dir: &Path, message: &str) -> Result<bool> {
    git(dir, &["add", "-A"])?;
    if git(dir, &["diff", "--cached", "--name-only"])?.is_empty() {
        return Ok(false);
    }
    git(dir, &["commit", "--no-verify", "-m", message])?;
    Ok(true)
}

/// Merge `source_branch` into the current branch of `repo_root`.
///
/// On conflict the merge is aborted so the checkout is left clean.
pub fn merge_branch(repo_root: &Path, source_branch: &str) -> Result<MergeOutcome> {
    let output = Command::new("git")
        .args(["merge", "--no-ff", "--no-edit", source_branch])
        .current_dir(repo_root)
        .output()?;

    if output.status.success() {
        return Ok(MergeOutcome::Merged);
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stdout.contains("CONFLICT") || stderr.contains("Automatic merge failed") {
        let files = git(repo_root, &["diff", "--name-only", "--diff-filter=U"])
            .map(|out| out.lines().map(String::from).collect())
            .unwrap_or_default();
        git(repo_root, &["merge", "--abort"])?;
        return Ok(MergeOutcome::Conflict(files));
    }

    Err(GitError::CommandFailed(format!(
        "git merge {source_branch}: {}",
        stderr.trim()
    )))
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_repo_name() {
        assert_eq!(repo_name(Path::new("/home/user/my-project")), "my-project");
        assert_eq!(repo_name(Path::new("/")), "repo");
    }

    #[test]
    fn test_create_and_remove_worktree() {
        let repo = setup_test_repo();
        let wt_root = TempDir::new().unwrap();
        let wt = wt_root.path().join("demo/attempt-1");

        create_worktree(repo.path(), &wt, "crew/attempt-1", "main").unwrap();
        assert!(wt.join("README.md").exists());
        assert!(branch_exists(repo.path(), "crew/attempt-1").unwrap());
        assert!(is_registered_worktree(repo.path(), &wt).unwrap());
        assert_eq!(current_branch(&wt).unwrap(), "crew/attempt-1");

        remove_worktree_force(repo.path(), &wt).unwrap();
        assert!(!wt.exists());
        assert!(!is_registered_worktree(repo.path(), &wt).unwrap());

        delete_branch(repo.path(), "crew/attempt-1").unwrap();
        assert!(!branch_exists(repo.path(), "crew/attempt-1").unwrap());
    }

    #[test]
    fn test_create_worktree_bad_base_fails() {
        let repo = setup_test_repo();
        let wt_root = TempDir::new().unwrap();
        let err = create_worktree(
            repo.path(),
            &wt_root.path().join("x"),
            "crew/x",
            "does-not-exist",
        )
        .unwrap_err();
        assert!(matches!(err, GitError::CommandFailed(_)));
    }

    #[test]
    fn test_diff_includes_untracked_files() {
        let repo = setup_test_repo();
        let base = rev_parse(repo.path(), "main").unwrap();
        let wt_root = TempDir::new().unwrap();
        let wt = wt_root.path().join("wt");
        create_worktree(repo.path(), &wt, "crew/diff", "main").unwrap();

        assert!(diff_against(&wt, &base).unwrap().is_empty());

        std::fs::write(wt.join("new.txt"), "hello\n").unwrap();
        let diff = diff_against(&wt, &base).unwrap();
        assert!(diff.contains("new.txt"));
        assert!(diff.contains("+hello"));
    }

    #[test]
    fn test_is_working_tree_clean() {
        let dir = setup_test_repo();
        assert!(is_working_tree_clean(dir.path()).unwrap());

        std::fs::write(dir.path().join("untracked.txt"), "data").unwrap();
        assert!(!is_working_tree_clean(dir.path()).unwrap());
    }

    #[test]
    fn test_merge_branch_no_conflict() {
        let repo = setup_test_repo();
        git_ok(repo.path(), &["checkout", "-b", "feature"]);
        std::fs::write(repo.path().join("feature.txt"), "feature content").unwrap();
        assert!(commit_all(repo.path(), "Add feature").unwrap());
        assert!(!commit_all(repo.path(), "nothing").unwrap());

        checkout_branch(repo.path(), "main").unwrap();
        assert_eq!(
            merge_branch(repo.path(), "feature").unwrap(),
            MergeOutcome::Merged
        );
        assert!(repo.path().join("feature.txt").exists());
    }

    #[test]
    fn test_merge_branch_conflict_is_aborted() {
        let repo = setup_test_repo();
        git_ok(repo.path(), &["checkout", "-b", "feature"]);
        std::fs::write(repo.path().join("README.md"), "feature side\n").unwrap();
        commit_all(repo.path(), "feature edit").unwrap();

        checkout_branch(repo.path(), "main").unwrap();
        std::fs::write(repo.path().join("README.md"), "main side\n").unwrap();
        commit_all(repo.path(), "main edit").unwrap();

        let outcome = merge_branch(repo.path(), "feature").unwrap();
        assert_eq!(outcome, MergeOutcome::Conflict(vec!["README.md".to_string()]));
        assert!(is_working_tree_clean(repo.path()).unwrap());
    }
}
