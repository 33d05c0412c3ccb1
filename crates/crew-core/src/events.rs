//! Event types for the audit log.

use crate::types::{AttemptStatus, ExecutionErrorCode, Id, PrStatus, RunStatus};
use serde::{Deserialize, Serialize};

/// Event type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    RunStarted,
    AttemptQueued,
    AttemptStarted,
    AttemptFinished,
    RunFinished,
    PrStatusChanged,
    WorkspaceRemoved,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStarted => "RUN_STARTED",
            Self::AttemptQueued => "ATTEMPT_QUEUED",
            Self::AttemptStarted => "ATTEMPT_STARTED",
            Self::AttemptFinished => "ATTEMPT_FINISHED",
            Self::RunFinished => "RUN_FINISHED",
            Self::PrStatusChanged => "PR_STATUS_CHANGED",
            Self::WorkspaceRemoved => "WORKSPACE_REMOVED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStartedPayload {
    pub run_id: Id,
    pub max_parallel: u32,
    pub task_ids: Vec<Id>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptQueuedPayload {
    pub attempt_id: Id,
    pub task_id: Id,
    pub queue_position: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptStartedPayload {
    pub attempt_id: Id,
    pub branch_name: String,
    pub worktree_path: String,
}

/// Payload for ATTEMPT_FINISHED; emitted once per attempt, by the winning terminal write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptFinishedPayload {
    pub attempt_id: Id,
    pub status: AttemptStatus,
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ExecutionErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFinishedPayload {
    pub run_id: Id,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrStatusChangedPayload {
    pub attempt_id: Id,
    pub pr_number: i64,
    pub from: Option<PrStatus>,
    pub to: PrStatus,
    /// Webhook delivery id, or `None` when the change came from a sync poll.
    pub delivery_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceRemovedPayload {
    pub attempt_id: Id,
    pub removed_worktree: bool,
    pub removed_branch: bool,
    pub removed_dir: bool,
}

/// Union type for all event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    RunStarted(RunStartedPayload),
    AttemptQueued(AttemptQueuedPayload),
    AttemptStarted(AttemptStartedPayload),
    AttemptFinished(AttemptFinishedPayload),
    RunFinished(RunFinishedPayload),
    PrStatusChanged(PrStatusChangedPayload),
    WorkspaceRemoved(WorkspaceRemovedPayload),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::RunStarted(_) => EventType::RunStarted,
            Self::AttemptQueued(_) => EventType::AttemptQueued,
            Self::AttemptStarted(_) => EventType::AttemptStarted,
            Self::AttemptFinished(_) => EventType::AttemptFinished,
            Self::RunFinished(_) => EventType::RunFinished,
            Self::PrStatusChanged(_) => EventType::PrStatusChanged,
            Self::WorkspaceRemoved(_) => EventType::WorkspaceRemoved,
        }
    }

    /// Attempt the event concerns, if any.
    pub fn attempt_id(&self) -> Option<&Id> {
        match self {
            Self::RunStarted(_) | Self::RunFinished(_) => None,
            Self::AttemptQueued(p) => Some(&p.attempt_id),
            Self::AttemptStarted(p) => Some(&p.attempt_id),
            Self::AttemptFinished(p) => Some(&p.attempt_id),
            Self::PrStatusChanged(p) => Some(&p.attempt_id),
            Self::WorkspaceRemoved(p) => Some(&p.attempt_id),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
