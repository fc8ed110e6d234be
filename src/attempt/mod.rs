//! Attempt lifecycle coordination.
//!
//! The coordinator ties the store, worktree manager, supervisor and profile
//! registry together and enforces the mutual-exclusion rules: at most one
//! running setup/cleanup/coding-agent process per attempt, and at most one
//! attempt per task doing such work. Dev servers are exempt. Lifecycle
//! operations on one attempt are serialized through a per-attempt lock.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::pr::PullRequestProvider;
use crate::process::{wait_exit, Supervisor};
use crate::profile::{ExecutorProfileId, ProfileRegistry, ResolvedCommand};
use crate::store::model::{
    new_id, BranchStatus, ExecutionProcess, ExecutorAction, ExecutorActionType, Merge,
    ProcessStatus, RestoreResult, RunReason, ScriptContext, Task, TaskAttempt, TaskStatus,
};
use crate::store::{new_running_process, StateStore};
use crate::worktree::WorktreeManager;

pub struct CreateAttemptRequest {
    pub task_id: Uuid,
    pub executor_profile: ExecutorProfileId,
    /// Explicit base branch; resolved when absent (see `resolve_base_branch`).
    pub base_branch: Option<String>,
    /// Adopt the branch + worktree of a live sibling attempt instead of
    /// allocating a fresh one.
    pub reuse_branch_of_attempt_id: Option<Uuid>,
    /// Initial prompt; defaults to the task title and description.
    pub prompt: Option<String>,
    pub model_override: Option<String>,
}

pub struct FollowUpRequest {
    pub attempt_id: Uuid,
    pub prompt: String,
    /// Per-call override; beats the latest turn's profile, which beats the
    /// attempt's stored profile.
    pub executor_profile: Option<ExecutorProfileId>,
    pub model_override: Option<String>,
    /// Paths of attached files, appended to the prompt text.
    pub attachments: Vec<PathBuf>,
}

pub struct Coordinator {
    config: Arc<OrchestratorConfig>,
    store: Arc<StateStore>,
    worktrees: Arc<WorktreeManager>,
    supervisor: Arc<Supervisor>,
    profiles: Arc<ProfileRegistry>,
    pr: Option<Arc<dyn PullRequestProvider>>,
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl Coordinator {
    pub fn new(
        config: Arc<OrchestratorConfig>,
        store: Arc<StateStore>,
        worktrees: Arc<WorktreeManager>,
        supervisor: Arc<Supervisor>,
        profiles: Arc<ProfileRegistry>,
        pr: Option<Arc<dyn PullRequestProvider>>,
    ) -> Self {
        Self {
            config,
            store,
            worktrees,
            supervisor,
            profiles,
            pr,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn attempt_lock(&self, attempt_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(attempt_id)
            .or_default()
            .clone()
    }

    // ─── Tasks ───────────────────────────────────────────────────────────────

    pub fn create_task(&self, title: impl Into<String>, description: Option<String>) -> Task {
        let task = Task::new(title, description);
        self.store.insert_task(task.clone());
        task
    }

    /// Spin a new task off an existing attempt, keeping the lineage pointer.
    pub fn create_task_from_attempt(
        &self,
        title: impl Into<String>,
        description: Option<String>,
        attempt_id: Uuid,
    ) -> Result<Task> {
        if self.store.attempt(attempt_id).is_none() {
            return Err(OrchestratorError::not_found("attempt", attempt_id));
        }
        let mut task = Task::new(title, description);
        task.parent_task_attempt = Some(attempt_id);
        self.store.insert_task(task.clone());
        Ok(task)
    }

    pub async fn delete_task(&self, task_id: Uuid) -> Result<()> {
        if self.store.task(task_id).is_none() {
            return Err(OrchestratorError::not_found("task", task_id));
        }
        for attempt in self.store.attempts_for_task(task_id) {
            for pid in self.store.running_for_attempt(attempt.id) {
                if let Err(e) = self.supervisor.stop(pid).await {
                    warn!(process_id = %pid, err = %e, "stop during task deletion failed");
                }
            }
        }
        let removed = self.store.remove_task(task_id);
        for attempt in removed {
            self.destroy_container(&attempt).await;
        }
        Ok(())
    }

    // ─── Attempt creation ────────────────────────────────────────────────────

    /// Create an attempt and launch its first work: setup script when
    /// configured, then the initial coding-agent turn. Returns once the
    /// first process is launched, never waits for completion.
    pub async fn create_attempt(self: &Arc<Self>, req: CreateAttemptRequest) -> Result<TaskAttempt> {
        let task = self
            .store
            .task(req.task_id)
            .ok_or_else(|| OrchestratorError::not_found("task", req.task_id))?;
        let attempt_id = new_id();

        let (branch, base_branch, container) = match req.reuse_branch_of_attempt_id {
            Some(source_id) => {
                let source = self
                    .store
                    .attempt(source_id)
                    .ok_or_else(|| OrchestratorError::not_found("attempt", source_id))?;
                if source.task_id != req.task_id {
                    return Err(OrchestratorError::Vcs(
                        "reuse source belongs to a different task".into(),
                    ));
                }
                let container = match (&source.container_ref, source.worktree_deleted) {
                    (Some(path), false) => path.clone(),
                    _ => {
                        return Err(OrchestratorError::Vcs(
                            "reuse source no longer has a live worktree".into(),
                        ))
                    }
                };
                (source.branch.clone(), source.base_branch.clone(), container)
            }
            None => {
                let base = self
                    .resolve_base_branch(req.task_id, req.base_branch.clone())
                    .await?;
                let branch = WorktreeManager::branch_name(attempt_id, &task.title);
                if self.store.branch_in_use(&branch, None) {
                    return Err(OrchestratorError::Vcs(format!(
                        "branch '{branch}' is already owned by a live attempt"
                    )));
                }
                let path = self
                    .worktrees
                    .create(&self.config.repo, &base, &branch, attempt_id)
                    .await?;
                (branch, base, path)
            }
        };

        // Only one attempt per task may run exclusive work; stop siblings
        // best-effort before this one takes over.
        for pid in self.store.running_exclusive_for_task(task.id) {
            if let Err(e) = self.supervisor.stop(pid).await {
                warn!(process_id = %pid, err = %e, "sibling stop failed; continuing");
            }
        }

        let attempt = TaskAttempt {
            id: attempt_id,
            task_id: task.id,
            branch,
            base_branch,
            container_ref: Some(container),
            executor_profile: req.executor_profile.clone(),
            worktree_deleted: false,
            created_at: Utc::now(),
        };
        self.store.insert_attempt(attempt.clone());
        if task.status == TaskStatus::Todo {
            self.store.update_task_status(task.id, TaskStatus::InProgress);
        }
        info!(attempt_id = %attempt_id, task_id = %task.id, branch = %attempt.branch, "attempt created");

        let prompt = req.prompt.unwrap_or_else(|| initial_prompt(&task));
        let agent = ExecutorAction::new(
            ExecutorActionType::CodingAgentInitial {
                prompt,
                executor_profile: req.executor_profile,
                model_override: req.model_override,
            },
            self.cleanup_action(),
        );
        let first = match &self.config.setup_script {
            Some(script) => ExecutorAction::new(
                ExecutorActionType::Script {
                    script: script.clone(),
                    context: ScriptContext::SetupScript,
                },
                Some(Box::new(agent)),
            ),
            None => agent,
        };
        self.launch(attempt_id, first).await?;
        Ok(attempt)
    }

    /// Base branch resolution when the caller gives none: newest live
    /// sibling attempt's branch, else the branch checked out in the main
    /// repository, else the configured default.
    async fn resolve_base_branch(&self, task_id: Uuid, explicit: Option<String>) -> Result<String> {
        if let Some(branch) = explicit {
            return Ok(branch);
        }
        if let Some(sibling) = self
            .store
            .attempts_for_task(task_id)
            .into_iter()
            .find(|a| !a.worktree_deleted && a.container_ref.is_some())
        {
            debug!(task_id = %task_id, base = %sibling.branch, "base branch from newest sibling attempt");
            return Ok(sibling.branch);
        }
        if let Some(current) = self.worktrees.current_branch(&self.config.repo).await? {
            return Ok(current);
        }
        Ok(self.config.base_branch.clone())
    }

    // ─── Process launching ───────────────────────────────────────────────────

    /// Launch an action for an attempt and arm the chain monitor. Boxed so
    /// the monitor can launch the follow-on action through the same path.
    pub fn launch(
        self: &Arc<Self>,
        attempt_id: Uuid,
        action: ExecutorAction,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutionProcess>> + Send>> {
        let this = Arc::clone(self);
        Box::pin(this.launch_inner(attempt_id, action))
    }

    async fn launch_inner(
        self: Arc<Self>,
        attempt_id: Uuid,
        action: ExecutorAction,
    ) -> Result<ExecutionProcess> {
        let attempt = self
            .store
            .attempt(attempt_id)
            .ok_or_else(|| OrchestratorError::not_found("attempt", attempt_id))?;
        let cwd = attempt
            .container_ref
            .clone()
            .ok_or_else(|| OrchestratorError::Vcs("attempt worktree has been deleted".into()))?;
        let run_reason = run_reason_of(&action.typ);
        let cmd = self.resolve_command(&action.typ)?;
        let before_head = self.worktrees.head_oid(&cwd).await.ok();

        let process = new_running_process(attempt_id, run_reason, action, before_head);
        let process_id = process.id;
        let mut exit = self.supervisor.spawn(process.clone(), &cmd, &cwd).await?;
        info!(attempt_id = %attempt_id, process_id = %process_id, reason = ?run_reason, "process launched");

        let this = self.clone();
        tokio::spawn(async move {
            let status = wait_exit(&mut exit).await;
            let Some(record) = this.store.process(process_id) else {
                return;
            };
            if record.dropped {
                return;
            }
            match status {
                Some(ProcessStatus::Completed) => {
                    let Some(next) = record.action.cleanup_action else {
                        return;
                    };
                    // Serialize with lifecycle operations: a follow-up may
                    // take the attempt between this process going terminal
                    // and the chain firing, and a restore may drop us.
                    let lock = this.attempt_lock(attempt_id);
                    let _guard = lock.lock().await;
                    if this
                        .store
                        .process(process_id)
                        .map(|p| p.dropped)
                        .unwrap_or(true)
                    {
                        return;
                    }
                    if run_reason_of(&next.typ).is_exclusive()
                        && this.store.attempt_busy(attempt_id)
                    {
                        warn!(attempt_id = %attempt_id, "attempt busy; chained action skipped");
                        return;
                    }
                    if let Err(e) = this.launch(attempt_id, *next).await {
                        warn!(attempt_id = %attempt_id, err = %e, "chained action failed to launch");
                    }
                }
                _ if record.run_reason == RunReason::SetupScript => {
                    warn!(attempt_id = %attempt_id, process_id = %process_id, "setup script did not complete; coding-agent turn skipped");
                }
                _ => {}
            }
        });
        Ok(process)
    }

    fn resolve_command(&self, typ: &ExecutorActionType) -> Result<ResolvedCommand> {
        match typ {
            ExecutorActionType::Script { script, .. } => Ok(ResolvedCommand {
                program: "sh".into(),
                args: vec!["-c".into(), script.clone()],
            }),
            ExecutorActionType::CodingAgentInitial {
                prompt,
                executor_profile,
                model_override,
            } => self
                .profiles
                .resolve(executor_profile, model_override.as_deref(), false, prompt)
                .ok_or_else(|| {
                    OrchestratorError::Spawn(format!("no executor profile '{executor_profile}'"))
                }),
            ExecutorActionType::CodingAgentFollowUp {
                prompt,
                executor_profile,
                model_override,
            } => self
                .profiles
                .resolve(executor_profile, model_override.as_deref(), true, prompt)
                .ok_or_else(|| {
                    OrchestratorError::Spawn(format!("no executor profile '{executor_profile}'"))
                }),
        }
    }

    fn cleanup_action(&self) -> Option<Box<ExecutorAction>> {
        self.config.cleanup_script.as_ref().map(|script| {
            Box::new(ExecutorAction::new(
                ExecutorActionType::Script {
                    script: script.clone(),
                    context: ScriptContext::CleanupScript,
                },
                None,
            ))
        })
    }

    // ─── Follow-up turns ─────────────────────────────────────────────────────

    pub async fn follow_up(self: &Arc<Self>, req: FollowUpRequest) -> Result<ExecutionProcess> {
        let lock = self.attempt_lock(req.attempt_id);
        let _guard = lock.lock().await;

        let attempt = self
            .store
            .attempt(req.attempt_id)
            .ok_or_else(|| OrchestratorError::not_found("attempt", req.attempt_id))?;
        if self.store.attempt_busy(attempt.id) {
            return Err(OrchestratorError::AttemptBusy(attempt.id));
        }

        let executor_profile = req
            .executor_profile
            .or_else(|| {
                self.store
                    .latest_coding_agent(attempt.id)
                    .and_then(|p| profile_of(&p.action.typ))
            })
            .unwrap_or_else(|| attempt.executor_profile.clone());

        let mut prompt = req.prompt;
        for path in &req.attachments {
            prompt.push('\n');
            prompt.push_str(&path.display().to_string());
        }

        let action = ExecutorAction::new(
            ExecutorActionType::CodingAgentFollowUp {
                prompt,
                executor_profile,
                model_override: req.model_override,
            },
            self.cleanup_action(),
        );
        self.launch(attempt.id, action).await
    }

    // ─── Stop / restore / delete ─────────────────────────────────────────────

    /// Stop everything running under the attempt, dev servers included.
    pub async fn stop(&self, attempt_id: Uuid) -> Result<()> {
        if self.store.attempt(attempt_id).is_none() {
            return Err(OrchestratorError::not_found("attempt", attempt_id));
        }
        for pid in self.store.running_for_attempt(attempt_id) {
            self.supervisor.stop(pid).await?;
        }
        Ok(())
    }

    /// Rewind the attempt to the state after `process_id`: later processes
    /// are dropped from derivations, and the worktree is reset to the
    /// process's recorded checkpoint when `perform_git_reset` is set.
    pub async fn restore(
        &self,
        attempt_id: Uuid,
        process_id: Uuid,
        perform_git_reset: bool,
        force_when_dirty: bool,
    ) -> Result<RestoreResult> {
        let lock = self.attempt_lock(attempt_id);
        let _guard = lock.lock().await;

        let attempt = self
            .store
            .attempt(attempt_id)
            .ok_or_else(|| OrchestratorError::not_found("attempt", attempt_id))?;
        let process = self
            .store
            .process(process_id)
            .filter(|p| p.attempt_id == attempt_id)
            .ok_or_else(|| OrchestratorError::not_found("process", process_id))?;
        if self.store.attempt_busy(attempt_id) {
            return Err(OrchestratorError::AttemptBusy(attempt_id));
        }
        let cwd = attempt
            .container_ref
            .clone()
            .ok_or_else(|| OrchestratorError::Vcs("attempt worktree has been deleted".into()))?;

        let procs = self.store.processes_for_attempt(attempt_id);
        let had_later_processes = procs
            .iter()
            .position(|p| p.id == process_id)
            .map(|idx| idx + 1 < procs.len())
            .unwrap_or(false);
        self.store.drop_processes_after(attempt_id, process_id);

        let target_after_oid = process.after_head_commit.clone();
        let current = self.worktrees.head_oid(&cwd).await.ok();
        let dirty = !self.worktrees.is_clean(&cwd).await.unwrap_or(true);
        // Reported even when the caller skips the reset; a dirty worktree
        // needs one even if HEAD already matches the checkpoint.
        let git_reset_needed =
            target_after_oid.is_some() && (current != target_after_oid || dirty);
        let mut git_reset_applied = false;
        if perform_git_reset && git_reset_needed {
            if let Some(target) = &target_after_oid {
                self.worktrees
                    .reset_to_commit(&cwd, target, force_when_dirty)
                    .await?;
                git_reset_applied = true;
            }
        }
        info!(
            attempt_id = %attempt_id,
            process_id = %process_id,
            reset = git_reset_applied,
            "attempt restored to checkpoint"
        );
        Ok(RestoreResult {
            had_later_processes,
            git_reset_needed,
            git_reset_applied,
            target_after_oid,
        })
    }

    pub async fn delete_attempt(&self, attempt_id: Uuid) -> Result<()> {
        let lock = self.attempt_lock(attempt_id);
        let _guard = lock.lock().await;

        if self.store.attempt(attempt_id).is_none() {
            return Err(OrchestratorError::not_found("attempt", attempt_id));
        }
        for pid in self.store.running_for_attempt(attempt_id) {
            self.supervisor.stop(pid).await?;
        }
        if let Some(attempt) = self.store.remove_attempt(attempt_id) {
            self.destroy_container(&attempt).await;
        }
        info!(attempt_id = %attempt_id, "attempt deleted");
        Ok(())
    }

    /// Remove the worktree unless another live attempt still shares it.
    async fn destroy_container(&self, attempt: &TaskAttempt) {
        let Some(path) = &attempt.container_ref else {
            return;
        };
        if attempt.worktree_deleted || self.store.container_in_use(path) {
            return;
        }
        if let Err(e) = self.worktrees.destroy(&self.config.repo, path).await {
            warn!(attempt_id = %attempt.id, err = %e, "worktree removal failed");
        }
    }

    // ─── Branch operations ───────────────────────────────────────────────────

    pub async fn branch_status(&self, attempt_id: Uuid) -> Result<BranchStatus> {
        let attempt = self
            .store
            .attempt(attempt_id)
            .ok_or_else(|| OrchestratorError::not_found("attempt", attempt_id))?;
        let cwd = attempt
            .container_ref
            .clone()
            .ok_or_else(|| OrchestratorError::Vcs("attempt worktree has been deleted".into()))?;

        if let Some(provider) = &self.pr {
            match provider.find_open_pr(&attempt.branch).await {
                Ok(Some(info)) => {
                    let known = self.store.merges(attempt_id).iter().any(|m| {
                        matches!(m, Merge::Pr { info: existing, .. } if existing.number == info.number)
                    });
                    if !known {
                        self.store.record_merge(
                            attempt_id,
                            Merge::Pr {
                                base_branch: attempt.base_branch.clone(),
                                info,
                            },
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(attempt_id = %attempt_id, err = %e, "pull request lookup failed"),
            }
        }
        let merges = self.store.merges(attempt_id);
        self.worktrees
            .status(&cwd, &attempt.branch, &attempt.base_branch, merges)
            .await
    }

    /// Replay the attempt branch onto a (possibly new) base. Updates the
    /// recorded base branch when it changes.
    pub async fn rebase(&self, attempt_id: Uuid, new_base: Option<String>) -> Result<()> {
        let lock = self.attempt_lock(attempt_id);
        let _guard = lock.lock().await;

        let attempt = self
            .store
            .attempt(attempt_id)
            .ok_or_else(|| OrchestratorError::not_found("attempt", attempt_id))?;
        if self.store.attempt_busy(attempt_id) {
            return Err(OrchestratorError::AttemptBusy(attempt_id));
        }
        let cwd = attempt
            .container_ref
            .clone()
            .ok_or_else(|| OrchestratorError::Vcs("attempt worktree has been deleted".into()))?;
        let old_base = attempt.base_branch.clone();
        let new_base = new_base.unwrap_or_else(|| old_base.clone());
        self.worktrees
            .rebase(&cwd, &attempt.branch, &old_base, &new_base)
            .await?;
        if new_base != old_base {
            let updated = new_base.clone();
            self.store
                .update_attempt(attempt_id, move |a| a.base_branch = updated);
        }
        Ok(())
    }

    /// Squash the attempt's commits into one commit on the base branch,
    /// record the merge and mark the task done. Local only, no push.
    pub async fn merge(&self, attempt_id: Uuid) -> Result<String> {
        let lock = self.attempt_lock(attempt_id);
        let _guard = lock.lock().await;

        let attempt = self
            .store
            .attempt(attempt_id)
            .ok_or_else(|| OrchestratorError::not_found("attempt", attempt_id))?;
        if self.store.attempt_busy(attempt_id) {
            return Err(OrchestratorError::AttemptBusy(attempt_id));
        }
        let task = self
            .store
            .task(attempt.task_id)
            .ok_or_else(|| OrchestratorError::not_found("task", attempt.task_id))?;
        let message = merge_message(&task, attempt_id);
        let commit = self
            .worktrees
            .merge(&self.config.repo, &attempt.branch, &attempt.base_branch, &message)
            .await?;
        self.store.record_merge(
            attempt_id,
            Merge::Direct {
                base_branch: attempt.base_branch.clone(),
                commit: commit.clone(),
                created_at: Utc::now(),
            },
        );
        self.store.update_task_status(task.id, TaskStatus::Done);
        info!(attempt_id = %attempt_id, commit = %commit, "attempt merged");
        Ok(commit)
    }

    // ─── Dev servers ─────────────────────────────────────────────────────────

    /// Launch the configured dev server in the attempt's worktree. Exempt
    /// from the exclusion rules, but only one per task: dev servers under
    /// sibling attempts are stopped first.
    pub async fn start_dev_server(self: &Arc<Self>, attempt_id: Uuid) -> Result<ExecutionProcess> {
        let lock = self.attempt_lock(attempt_id);
        let _guard = lock.lock().await;

        let attempt = self
            .store
            .attempt(attempt_id)
            .ok_or_else(|| OrchestratorError::not_found("attempt", attempt_id))?;
        let script = self
            .config
            .dev_server_script
            .clone()
            .ok_or_else(|| OrchestratorError::Spawn("no dev server script configured".into()))?;

        for sibling in self.store.attempts_for_task(attempt.task_id) {
            if sibling.id == attempt_id {
                continue;
            }
            for pid in self.store.running_for_attempt(sibling.id) {
                let is_dev = self
                    .store
                    .process(pid)
                    .is_some_and(|p| p.run_reason == RunReason::DevServer);
                if is_dev {
                    if let Err(e) = self.supervisor.stop(pid).await {
                        warn!(process_id = %pid, err = %e, "sibling dev server stop failed");
                    }
                }
            }
        }

        let action = ExecutorAction::new(
            ExecutorActionType::Script {
                script,
                context: ScriptContext::DevServer,
            },
            None,
        );
        self.launch(attempt_id, action).await
    }

    /// Stop every running process across all attempts.
    pub async fn shutdown(&self) {
        for pid in self.store.running_processes() {
            if let Err(e) = self.supervisor.stop(pid).await {
                warn!(process_id = %pid, err = %e, "stop during shutdown failed");
            }
        }
    }
}

fn run_reason_of(typ: &ExecutorActionType) -> RunReason {
    match typ {
        ExecutorActionType::CodingAgentInitial { .. }
        | ExecutorActionType::CodingAgentFollowUp { .. } => RunReason::CodingAgent,
        ExecutorActionType::Script { context, .. } => match context {
            ScriptContext::SetupScript => RunReason::SetupScript,
            ScriptContext::CleanupScript => RunReason::CleanupScript,
            ScriptContext::DevServer => RunReason::DevServer,
        },
    }
}

fn profile_of(typ: &ExecutorActionType) -> Option<ExecutorProfileId> {
    match typ {
        ExecutorActionType::CodingAgentInitial {
            executor_profile, ..
        }
        | ExecutorActionType::CodingAgentFollowUp {
            executor_profile, ..
        } => Some(executor_profile.clone()),
        ExecutorActionType::Script { .. } => None,
    }
}

fn initial_prompt(task: &Task) -> String {
    match &task.description {
        Some(d) if !d.is_empty() => format!("{}\n\n{d}", task.title),
        _ => task.title.clone(),
    }
}

fn merge_message(task: &Task, attempt_id: Uuid) -> String {
    let id = attempt_id.to_string();
    let short = id.split('-').next().unwrap_or(&id);
    match &task.description {
        Some(d) if !d.is_empty() => format!("{} ({short})\n\n{d}", task.title),
        _ => format!("{} ({short})", task.title),
    }
}
