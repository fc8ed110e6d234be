//! Core data model: tasks, attempts, execution processes, merges.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::profile::ExecutorProfileId;

/// Generate a new entity id.
pub fn new_id() -> Uuid {
    Uuid::new_v4()
}

// ─── Task ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    InReview,
    Done,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    /// Lineage pointer for spin-off tasks created from an attempt.
    pub parent_task_attempt: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(title: impl Into<String>, description: Option<String>) -> Self {
        Self {
            id: new_id(),
            title: title.into(),
            description,
            status: TaskStatus::Todo,
            parent_task_attempt: None,
            created_at: Utc::now(),
        }
    }
}

// ─── TaskAttempt ─────────────────────────────────────────────────────────────

/// One isolated execution lineage for a task, bound to one branch + worktree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAttempt {
    pub id: Uuid,
    pub task_id: Uuid,
    /// Dedicated branch name, e.g. `attempt/1f3a9c-fixlog`.
    pub branch: String,
    pub base_branch: String,
    /// Absolute path of the isolated worktree. None once deleted.
    pub container_ref: Option<PathBuf>,
    pub executor_profile: ExecutorProfileId,
    pub worktree_deleted: bool,
    pub created_at: DateTime<Utc>,
}

// ─── ExecutionProcess ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunReason {
    SetupScript,
    CleanupScript,
    CodingAgent,
    DevServer,
}

impl RunReason {
    /// Whether this process counts toward the one-running-per-attempt and
    /// one-running-attempt-per-task invariants. Dev servers are exempt.
    pub fn is_exclusive(self) -> bool {
        !matches!(self, RunReason::DevServer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    Completed,
    Failed,
    Killed,
}

impl ProcessStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ProcessStatus::Running)
    }
}

/// Serialized description of what a process ran. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorAction {
    pub typ: ExecutorActionType,
    /// Optional action chained after this one completes (e.g. cleanup script
    /// after a coding-agent turn).
    pub cleanup_action: Option<Box<ExecutorAction>>,
}

impl ExecutorAction {
    pub fn new(typ: ExecutorActionType, cleanup_action: Option<Box<ExecutorAction>>) -> Self {
        Self {
            typ,
            cleanup_action,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutorActionType {
    CodingAgentInitial {
        prompt: String,
        executor_profile: ExecutorProfileId,
        #[serde(skip_serializing_if = "Option::is_none")]
        model_override: Option<String>,
    },
    CodingAgentFollowUp {
        prompt: String,
        executor_profile: ExecutorProfileId,
        #[serde(skip_serializing_if = "Option::is_none")]
        model_override: Option<String>,
    },
    Script {
        script: String,
        context: ScriptContext,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptContext {
    SetupScript,
    CleanupScript,
    DevServer,
}

/// One invocation of a script or agent turn within an attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionProcess {
    pub id: Uuid,
    pub attempt_id: Uuid,
    pub run_reason: RunReason,
    pub status: ProcessStatus,
    pub exit_code: Option<i64>,
    /// Set true when invalidated by a restore. One-way flag.
    pub dropped: bool,
    pub action: ExecutorAction,
    /// Worktree HEAD when the process was launched.
    pub before_head_commit: Option<String>,
    /// Worktree HEAD when the process finished — the restore checkpoint.
    pub after_head_commit: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ─── Process output log ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogChannel {
    Stdout,
    Stderr,
    /// Structured status emitted by a coding agent instead of raw text
    /// (e.g. an `error_message` event).
    NormalizedEntry,
}

/// One line of captured process output, in emission order per channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub channel: LogChannel,
    pub content: String,
    pub ts: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(channel: LogChannel, content: impl Into<String>) -> Self {
        Self {
            channel,
            content: content.into(),
            ts: Utc::now(),
        }
    }
}

// ─── Merge history ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrStatus {
    Open,
    Merged,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequestInfo {
    pub status: PrStatus,
    pub number: i64,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

/// A recorded integration of an attempt branch into its base: either a local
/// squash commit or an externally-tracked pull request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Merge {
    Direct {
        base_branch: String,
        commit: String,
        created_at: DateTime<Utc>,
    },
    Pr {
        base_branch: String,
        info: PullRequestInfo,
    },
}

// ─── Derived branch status ───────────────────────────────────────────────────

/// Relationship of an attempt branch to its base. Recomputed on demand from
/// live repository state, never cached across mutations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchStatus {
    pub commits_ahead: Option<usize>,
    pub commits_behind: Option<usize>,
    pub remote_commits_ahead: Option<usize>,
    pub remote_commits_behind: Option<usize>,
    pub has_uncommitted_changes: Option<bool>,
    pub head_oid: Option<String>,
    pub uncommitted_count: Option<usize>,
    pub untracked_count: Option<usize>,
    pub base_branch_name: String,
    pub merges: Vec<Merge>,
}

// ─── Restore ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreResult {
    pub had_later_processes: bool,
    pub git_reset_needed: bool,
    pub git_reset_applied: bool,
    pub target_after_oid: Option<String>,
}
