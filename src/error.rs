//! Error taxonomy shared by the orchestrator components.
//!
//! Invariant violations (busy attempt, dirty worktree without force) reject
//! synchronously and leave state untouched. Non-zero process exits are NOT
//! errors — they are recorded on the process record as a `failed` outcome.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Ref resolution failure or branch name collision.
    #[error("vcs error: {0}")]
    Vcs(String),

    /// Rebase/merge hit conflicts. The worktree is left in its conflicted
    /// state for the user to inspect — never auto-resolved.
    #[error("operation stopped on conflicts in {path}: {detail}")]
    Conflict { path: String, detail: String },

    /// A destructive reset was requested while uncommitted changes exist.
    #[error("worktree has uncommitted changes; pass force_when_dirty to discard them")]
    DirtyWorktree,

    /// Process launch failure (missing binary, permission denied, ...).
    #[error("failed to spawn process: {0}")]
    Spawn(String),

    /// Another process is already running on this attempt — stop it first.
    #[error("attempt {0} already has a running process — stop it first")]
    AttemptBusy(Uuid),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },
}

impl OrchestratorError {
    pub fn not_found(kind: &'static str, id: Uuid) -> Self {
        Self::NotFound { kind, id }
    }
}

impl From<git2::Error> for OrchestratorError {
    fn from(e: git2::Error) -> Self {
        OrchestratorError::Vcs(e.message().to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
