//! Core types for the attempt orchestrator.
//!
//! Tasks are owned by the external board; projects, runs, attempts and
//! their workspaces are owned by the daemon.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for projects, tasks, runs, attempts, events, and artifacts.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Trailing 12 characters, used where a short but unique tag is needed.
    pub fn short(&self) -> &str {
        let len = self.0.len();
        if len > 12 {
            &self.0[len - 12..]
        } else {
            &self.0
        }
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Board column of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    InReview,
    Done,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::InReview => "in_review",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "todo" => Some(Self::Todo),
            "in_progress" => Some(Self::InProgress),
            "in_review" => Some(Self::InReview),
            "done" => Some(Self::Done),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Only open columns may be selected into a run.
    pub fn is_admissible(&self) -> bool {
        matches!(self, Self::Todo | Self::InProgress | Self::InReview)
    }
}

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Attempt lifecycle status.
///
/// `pending -> queued -> running -> {completed, failed, stopped}`; any
/// non-terminal status may also move straight to `stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl AttemptStatus {
    pub const ALL: [Self; 6] = [
        Self::Pending,
        Self::Queued,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Stopped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    /// Whether the attempt holds one of its run's concurrency slots.
    pub fn occupies_slot(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    /// Statuses from which `self` may be entered.
    pub fn predecessors(&self) -> &'static [AttemptStatus] {
        match self {
            Self::Pending => &[],
            Self::Queued => &[Self::Pending],
            Self::Running => &[Self::Queued],
            Self::Completed | Self::Failed => &[Self::Running],
            Self::Stopped => &[Self::Pending, Self::Queued, Self::Running],
        }
    }

    pub fn can_transition_to(&self, next: AttemptStatus) -> bool {
        next.predecessors().contains(self)
    }
}

/// Pull-request status mirrored from the git provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrStatus {
    Open,
    Merged,
    Closed,
}

impl PrStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Merged => "merged",
            Self::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "merged" => Some(Self::Merged),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Outcome of applying an attempt's branch onto the project base branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Applied,
    Conflict,
    Failed,
}

impl MergeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Conflict => "conflict",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "applied" => Some(Self::Applied),
            "conflict" => Some(Self::Conflict),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Workspace teardown state recorded on the attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStatus {
    /// Terminal transition happened; teardown has not run yet.
    Scheduled,
    Cleaned,
    Failed,
}

impl CleanupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Cleaned => "cleaned",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(Self::Scheduled),
            "cleaned" => Some(Self::Cleaned),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Kind of artifact persisted with a terminal transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Diff,
    Summary,
    Error,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Diff => "diff",
            Self::Summary => "summary",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "diff" => Some(Self::Diff),
            "summary" => Some(Self::Summary),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Execution failure classes captured on an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionErrorCode {
    GitError,
    RunnerError,
    EmptyDiff,
    Timeout,
}

impl ExecutionErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GitError => "GIT_ERROR",
            Self::RunnerError => "RUNNER_ERROR",
            Self::EmptyDiff => "EMPTY_DIFF",
            Self::Timeout => "TIMEOUT",
        }
    }
}

/// Exit code recorded when an agent exceeds its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code recorded for an explicit stop.
pub const STOPPED_EXIT_CODE: i32 = -1;

// --- Records ---

/// A project: one git repository the board manages tasks for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Id,
    pub name: String,
    /// Local clone the workspaces are branched from.
    pub repo_path: String,
    /// Remote URL, used to route pull-request webhooks.
    pub repo_url: Option<String>,
    pub default_branch: String,
    pub created_at: DateTime<Utc>,
}

/// A unit of work on the board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Id,
    pub project_id: Id,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-status attempt counts of a run; always derived from the attempt rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub pending: u32,
    pub queued: u32,
    pub running: u32,
    pub completed: u32,
    pub failed: u32,
    pub stopped: u32,
}

impl RunCounts {
    pub fn add(&mut self, status: AttemptStatus, n: u32) {
        match status {
            AttemptStatus::Pending => self.pending += n,
            AttemptStatus::Queued => self.queued += n,
            AttemptStatus::Running => self.running += n,
            AttemptStatus::Completed => self.completed += n,
            AttemptStatus::Failed => self.failed += n,
            AttemptStatus::Stopped => self.stopped += n,
        }
    }

    pub fn total(&self) -> u32 {
        self.pending + self.queued + self.running + self.completed + self.failed + self.stopped
    }

    /// Attempts holding a concurrency slot.
    pub fn occupied(&self) -> u32 {
        self.queued + self.running
    }

    /// Attempts that have not reached a terminal status.
    pub fn active(&self) -> u32 {
        self.pending + self.queued + self.running
    }
}

/// A bounded-concurrency batch of attempts against one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Id,
    pub project_id: Id,
    pub status: RunStatus,
    pub max_parallel: u32,
    /// Task ids in caller order; admission follows this order.
    pub selected_task_ids: Vec<Id>,
    pub counts: RunCounts,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Isolated git working directory bound to one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptWorkspace {
    pub path: String,
    pub branch_name: String,
    pub base_branch: String,
    pub base_commit: String,
}

/// Pull-request metadata attached to an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: i64,
    pub url: String,
    pub status: PrStatus,
}

/// One execution of a task by an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub id: Id,
    pub task_id: Id,
    pub run_id: Id,
    pub project_id: Id,
    pub status: AttemptStatus,
    /// Index of the task in the run's selected list.
    pub queue_position: u32,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error_code: Option<ExecutionErrorCode>,
    pub error_message: Option<String>,
    pub workspace: Option<AttemptWorkspace>,
    pub cleanup_status: Option<CleanupStatus>,
    pub cleaned_at: Option<DateTime<Utc>>,
    pub merge_status: Option<MergeStatus>,
    pub conflict_files: Vec<String>,
    pub apply_error: Option<String>,
    pub pull_request: Option<PullRequest>,
    pub cost_usd: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl Attempt {
    /// A fresh, not yet admitted attempt.
    pub fn pending(task: &Task, run_id: &Id, queue_position: u32) -> Self {
        Self {
            id: Id::new(),
            task_id: task.id.clone(),
            run_id: run_id.clone(),
            project_id: task.project_id.clone(),
            status: AttemptStatus::Pending,
            queue_position,
            queued_at: None,
            started_at: None,
            finished_at: None,
            exit_code: None,
            error_code: None,
            error_message: None,
            workspace: None,
            cleanup_status: None,
            cleaned_at: None,
            merge_status: None,
            conflict_files: Vec::new(),
            apply_error: None,
            pull_request: None,
            cost_usd: None,
            created_at: Utc::now(),
        }
    }
}

/// Terminal artifact stored alongside an attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Id,
    pub attempt_id: Id,
    pub kind: ArtifactKind,
    pub content: String,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

/// Audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Id,
    pub run_id: Id,
    pub attempt_id: Option<Id>,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub payload_json: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_transitions_follow_lifecycle() {
        use AttemptStatus::*;
        assert!(Pending.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Stopped));
        assert!(Queued.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Stopped));

        assert!(!Pending.can_transition_to(Running));
        assert!(!Queued.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
    }

    #[test]
    fn terminal_statuses_admit_no_transition() {
        for terminal in [AttemptStatus::Completed, AttemptStatus::Failed, AttemptStatus::Stopped] {
            assert!(terminal.is_terminal());
            for next in AttemptStatus::ALL {
                assert!(
                    !terminal.can_transition_to(next),
                    "{} -> {} should be rejected",
                    terminal.as_str(),
                    next.as_str()
                );
            }
        }
    }

    #[test]
    fn only_open_columns_are_admissible() {
        assert!(TaskStatus::Todo.is_admissible());
        assert!(TaskStatus::InProgress.is_admissible());
        assert!(TaskStatus::InReview.is_admissible());
        assert!(!TaskStatus::Done.is_admissible());
        assert!(!TaskStatus::Cancelled.is_admissible());
    }

    #[test]
    fn status_strings_round_trip() {
        for status in AttemptStatus::ALL {
            assert_eq!(AttemptStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("cancelled"), Some(RunStatus::Cancelled));
        assert_eq!(PrStatus::parse("merged"), Some(PrStatus::Merged));
        assert_eq!(TaskStatus::parse("bogus"), None);
    }

    #[test]
    fn run_counts_track_slots() {
        let mut counts = RunCounts::default();
        counts.add(AttemptStatus::Pending, 3);
        counts.add(AttemptStatus::Queued, 1);
        counts.add(AttemptStatus::Running, 1);
        counts.add(AttemptStatus::Completed, 2);
        assert_eq!(counts.occupied(), 2);
        assert_eq!(counts.active(), 5);
        assert_eq!(counts.total(), 7);
    }

    #[test]
    fn short_id_is_trailing_suffix() {
        let id = Id::from_string("0190f3a2-1b2c-7d4e-8f90-a1b2c3d4e5f6");
        assert_eq!(id.short(), "a1b2c3d4e5f6");
        assert_eq!(Id::from_string("abc").short(), "abc");
    }
}
