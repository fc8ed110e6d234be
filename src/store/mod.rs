//! Authoritative in-memory state store + change-feed projector.
//!
//! All orchestration state (tasks, attempts, processes, merges, process
//! logs) lives behind one write lock. Every mutation updates the snapshot
//! AND broadcasts a sequence-numbered patch before the lock is released, so
//! the feed order always equals the mutation order — no gaps, no reordering.

pub mod model;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::events::{FeedBroadcaster, FeedSubscription, Patch, PatchOp, Scope, Snapshot};
use model::{
    ExecutionProcess, LogEntry, Merge, ProcessStatus, Task, TaskAttempt, TaskStatus,
};

#[derive(Default)]
struct Inner {
    seq: u64,
    tasks: HashMap<Uuid, Task>,
    attempts: HashMap<Uuid, TaskAttempt>,
    processes: HashMap<Uuid, ExecutionProcess>,
    /// Process ids per attempt in creation order — "later than" for restore
    /// is defined by this order, not by wall-clock timestamps.
    procs_by_attempt: HashMap<Uuid, Vec<Uuid>>,
    merges: HashMap<Uuid, Vec<Merge>>,
    logs: HashMap<Uuid, Vec<LogEntry>>,
}

pub struct StateStore {
    inner: Mutex<Inner>,
    feed: FeedBroadcaster,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

fn to_value<T: serde::Serialize>(v: &T) -> Value {
    serde_json::to_value(v).unwrap_or_default()
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            feed: FeedBroadcaster::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock means a panic mid-mutation; continuing with the
        // data is still the least-bad option for an in-memory view.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(inner: &mut Inner, feed: &FeedBroadcaster, task_id: Option<Uuid>, ops: Vec<PatchOp>) {
        inner.seq += 1;
        feed.broadcast(Patch {
            seq: inner.seq,
            task_id,
            ops,
        });
    }

    // ─── Subscription ────────────────────────────────────────────────────────

    /// Take a full snapshot and open a live patch stream in one step.
    ///
    /// The receiver is registered under the same lock that produced the
    /// snapshot, so the first patch it yields is always `snapshot.seq + 1`.
    pub fn subscribe(&self, scope: Scope) -> (Snapshot, FeedSubscription) {
        let inner = self.lock();
        let snapshot = Self::snapshot_locked(&inner, scope);
        let sub = self.feed.subscribe(scope);
        (snapshot, sub)
    }

    fn snapshot_locked(inner: &Inner, scope: Scope) -> Snapshot {
        let in_scope_task = |task_id: Uuid| match scope {
            Scope::All => true,
            Scope::Task(id) => task_id == id,
        };
        let attempts: HashMap<Uuid, TaskAttempt> = inner
            .attempts
            .iter()
            .filter(|(_, a)| in_scope_task(a.task_id))
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        let processes: HashMap<Uuid, ExecutionProcess> = inner
            .processes
            .iter()
            .filter(|(_, p)| attempts.contains_key(&p.attempt_id))
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        Snapshot {
            seq: inner.seq,
            tasks: inner
                .tasks
                .iter()
                .filter(|(id, _)| in_scope_task(**id))
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
            merges: inner
                .merges
                .iter()
                .filter(|(id, _)| attempts.contains_key(id))
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
            logs: inner
                .logs
                .iter()
                .filter(|(id, _)| processes.contains_key(id))
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
            attempts,
            processes,
        }
    }

    // ─── Tasks ───────────────────────────────────────────────────────────────

    pub fn insert_task(&self, task: Task) {
        let mut inner = self.lock();
        let ops = vec![PatchOp::Add {
            path: format!("/tasks/{}", task.id),
            value: to_value(&task),
        }];
        let id = task.id;
        inner.tasks.insert(id, task);
        Self::emit(&mut inner, &self.feed, Some(id), ops);
    }

    pub fn task(&self, id: Uuid) -> Option<Task> {
        self.lock().tasks.get(&id).cloned()
    }

    pub fn update_task_status(&self, id: Uuid, status: TaskStatus) -> bool {
        let mut inner = self.lock();
        let Some(task) = inner.tasks.get_mut(&id) else {
            return false;
        };
        task.status = status;
        let ops = vec![PatchOp::Replace {
            path: format!("/tasks/{id}"),
            value: to_value(task),
        }];
        Self::emit(&mut inner, &self.feed, Some(id), ops);
        true
    }

    /// Remove a task and everything under it (attempts, processes, logs).
    pub fn remove_task(&self, id: Uuid) -> Vec<TaskAttempt> {
        let mut inner = self.lock();
        let attempt_ids: Vec<Uuid> = inner
            .attempts
            .values()
            .filter(|a| a.task_id == id)
            .map(|a| a.id)
            .collect();
        let mut removed = Vec::new();
        let mut ops = Vec::new();
        for attempt_id in attempt_ids {
            Self::remove_attempt_locked(&mut inner, attempt_id, &mut ops, &mut removed);
        }
        if inner.tasks.remove(&id).is_some() {
            ops.push(PatchOp::Remove {
                path: format!("/tasks/{id}"),
            });
        }
        if !ops.is_empty() {
            Self::emit(&mut inner, &self.feed, Some(id), ops);
        }
        removed
    }

    // ─── Attempts ────────────────────────────────────────────────────────────

    pub fn insert_attempt(&self, attempt: TaskAttempt) {
        let mut inner = self.lock();
        let ops = vec![PatchOp::Add {
            path: format!("/attempts/{}", attempt.id),
            value: to_value(&attempt),
        }];
        let task_id = attempt.task_id;
        inner.procs_by_attempt.entry(attempt.id).or_default();
        inner.attempts.insert(attempt.id, attempt);
        Self::emit(&mut inner, &self.feed, Some(task_id), ops);
    }

    pub fn attempt(&self, id: Uuid) -> Option<TaskAttempt> {
        self.lock().attempts.get(&id).cloned()
    }

    /// Attempts for a task, newest first.
    pub fn attempts_for_task(&self, task_id: Uuid) -> Vec<TaskAttempt> {
        let inner = self.lock();
        let mut attempts: Vec<TaskAttempt> = inner
            .attempts
            .values()
            .filter(|a| a.task_id == task_id)
            .cloned()
            .collect();
        attempts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        attempts
    }

    pub fn update_attempt<F>(&self, id: Uuid, mutate: F) -> bool
    where
        F: FnOnce(&mut TaskAttempt),
    {
        let mut inner = self.lock();
        let Some(attempt) = inner.attempts.get_mut(&id) else {
            return false;
        };
        mutate(attempt);
        let task_id = attempt.task_id;
        let ops = vec![PatchOp::Replace {
            path: format!("/attempts/{id}"),
            value: to_value(attempt),
        }];
        Self::emit(&mut inner, &self.feed, Some(task_id), ops);
        true
    }

    /// Is `path` already the container of a live (non-deleted) attempt?
    pub fn container_in_use(&self, path: &Path) -> bool {
        self.lock()
            .attempts
            .values()
            .any(|a| !a.worktree_deleted && a.container_ref.as_deref() == Some(path))
    }

    /// Is `branch` owned by a live attempt (optionally excluding one id)?
    pub fn branch_in_use(&self, branch: &str, exclude: Option<Uuid>) -> bool {
        self.lock().attempts.values().any(|a| {
            !a.worktree_deleted && a.branch == branch && Some(a.id) != exclude
        })
    }

    pub fn remove_attempt(&self, id: Uuid) -> Option<TaskAttempt> {
        let mut inner = self.lock();
        let task_id = inner.attempts.get(&id)?.task_id;
        let mut ops = Vec::new();
        let mut removed = Vec::new();
        Self::remove_attempt_locked(&mut inner, id, &mut ops, &mut removed);
        Self::emit(&mut inner, &self.feed, Some(task_id), ops);
        removed.pop()
    }

    fn remove_attempt_locked(
        inner: &mut Inner,
        id: Uuid,
        ops: &mut Vec<PatchOp>,
        removed: &mut Vec<TaskAttempt>,
    ) {
        for proc_id in inner.procs_by_attempt.remove(&id).unwrap_or_default() {
            inner.processes.remove(&proc_id);
            inner.logs.remove(&proc_id);
            ops.push(PatchOp::Remove {
                path: format!("/processes/{proc_id}"),
            });
        }
        inner.merges.remove(&id);
        if let Some(attempt) = inner.attempts.remove(&id) {
            ops.push(PatchOp::Remove {
                path: format!("/attempts/{id}"),
            });
            removed.push(attempt);
        }
    }

    // ─── Processes ───────────────────────────────────────────────────────────

    pub fn insert_process(&self, process: ExecutionProcess) {
        let mut inner = self.lock();
        let task_id = inner
            .attempts
            .get(&process.attempt_id)
            .map(|a| a.task_id);
        let ops = vec![PatchOp::Add {
            path: format!("/processes/{}", process.id),
            value: to_value(&process),
        }];
        inner
            .procs_by_attempt
            .entry(process.attempt_id)
            .or_default()
            .push(process.id);
        inner.logs.entry(process.id).or_default();
        inner.processes.insert(process.id, process);
        Self::emit(&mut inner, &self.feed, task_id, ops);
    }

    pub fn process(&self, id: Uuid) -> Option<ExecutionProcess> {
        self.lock().processes.get(&id).cloned()
    }

    /// Processes of an attempt in creation order.
    pub fn processes_for_attempt(&self, attempt_id: Uuid) -> Vec<ExecutionProcess> {
        let inner = self.lock();
        inner
            .procs_by_attempt
            .get(&attempt_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.processes.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn update_process<F>(&self, id: Uuid, mutate: F) -> bool
    where
        F: FnOnce(&mut ExecutionProcess),
    {
        let mut inner = self.lock();
        let Some(process) = inner.processes.get_mut(&id) else {
            return false;
        };
        mutate(process);
        let attempt_id = process.attempt_id;
        let ops = vec![PatchOp::Replace {
            path: format!("/processes/{id}"),
            value: to_value(process),
        }];
        let task_id = inner.attempts.get(&attempt_id).map(|a| a.task_id);
        Self::emit(&mut inner, &self.feed, task_id, ops);
        true
    }

    /// Mark every process of `attempt_id` created after `boundary` as
    /// dropped. Returns how many were newly dropped.
    pub fn drop_processes_after(&self, attempt_id: Uuid, boundary: Uuid) -> usize {
        let mut inner = self.lock();
        let Some(order) = inner.procs_by_attempt.get(&attempt_id) else {
            return 0;
        };
        let Some(idx) = order.iter().position(|id| *id == boundary) else {
            return 0;
        };
        let later: Vec<Uuid> = order[idx + 1..].to_vec();
        let mut ops = Vec::new();
        let mut dropped = 0;
        for id in later {
            if let Some(p) = inner.processes.get_mut(&id) {
                if !p.dropped {
                    p.dropped = true;
                    dropped += 1;
                    ops.push(PatchOp::Replace {
                        path: format!("/processes/{id}"),
                        value: to_value(p),
                    });
                }
            }
        }
        if !ops.is_empty() {
            let task_id = inner.attempts.get(&attempt_id).map(|a| a.task_id);
            Self::emit(&mut inner, &self.feed, task_id, ops);
        }
        dropped
    }

    /// Running setup/cleanup/coding-agent process ids across all attempts of
    /// a task. Dev servers are exempt from the exclusion rule.
    pub fn running_exclusive_for_task(&self, task_id: Uuid) -> Vec<Uuid> {
        let inner = self.lock();
        inner
            .processes
            .values()
            .filter(|p| {
                p.status == ProcessStatus::Running
                    && p.run_reason.is_exclusive()
                    && inner
                        .attempts
                        .get(&p.attempt_id)
                        .is_some_and(|a| a.task_id == task_id)
            })
            .map(|p| p.id)
            .collect()
    }

    /// Does the attempt currently have a running non-dev-server process?
    pub fn attempt_busy(&self, attempt_id: Uuid) -> bool {
        self.lock().processes.values().any(|p| {
            p.attempt_id == attempt_id
                && p.status == ProcessStatus::Running
                && p.run_reason.is_exclusive()
        })
    }

    /// Every running process id across all attempts (shutdown sweep).
    pub fn running_processes(&self) -> Vec<Uuid> {
        self.lock()
            .processes
            .values()
            .filter(|p| p.status == ProcessStatus::Running)
            .map(|p| p.id)
            .collect()
    }

    /// Any running process of the attempt (dev servers included).
    pub fn running_for_attempt(&self, attempt_id: Uuid) -> Vec<Uuid> {
        self.lock()
            .processes
            .values()
            .filter(|p| p.attempt_id == attempt_id && p.status == ProcessStatus::Running)
            .map(|p| p.id)
            .collect()
    }

    /// Latest non-dropped coding-agent process of an attempt, if any.
    pub fn latest_coding_agent(&self, attempt_id: Uuid) -> Option<ExecutionProcess> {
        let inner = self.lock();
        let order = inner.procs_by_attempt.get(&attempt_id)?;
        order
            .iter()
            .rev()
            .filter_map(|id| inner.processes.get(id))
            .find(|p| !p.dropped && p.run_reason == model::RunReason::CodingAgent)
            .cloned()
    }

    // ─── Process logs ────────────────────────────────────────────────────────

    pub fn append_log(&self, process_id: Uuid, entry: LogEntry) {
        let mut inner = self.lock();
        let task_id = inner
            .processes
            .get(&process_id)
            .and_then(|p| inner.attempts.get(&p.attempt_id))
            .map(|a| a.task_id);
        let log = inner.logs.entry(process_id).or_default();
        let index = log.len();
        let op = PatchOp::Add {
            path: format!("/processes/{process_id}/log/{index}"),
            value: to_value(&entry),
        };
        log.push(entry);
        Self::emit(&mut inner, &self.feed, task_id, vec![op]);
    }

    pub fn log(&self, process_id: Uuid) -> Vec<LogEntry> {
        self.lock().logs.get(&process_id).cloned().unwrap_or_default()
    }

    /// Last stderr/normalized line of a process — the diagnostic surfaced
    /// next to a failed record.
    pub fn last_diagnostic(&self, process_id: Uuid) -> Option<LogEntry> {
        let inner = self.lock();
        inner.logs.get(&process_id).and_then(|log| {
            log.iter()
                .rev()
                .find(|e| e.channel != model::LogChannel::Stdout)
                .or_else(|| log.last())
                .cloned()
        })
    }

    // ─── Merges ──────────────────────────────────────────────────────────────

    pub fn record_merge(&self, attempt_id: Uuid, merge: Merge) {
        let mut inner = self.lock();
        let task_id = inner.attempts.get(&attempt_id).map(|a| a.task_id);
        let merges = inner.merges.entry(attempt_id).or_default();
        merges.insert(0, merge);
        let op = PatchOp::Replace {
            path: format!("/attempts/{attempt_id}/merges"),
            value: to_value(merges),
        };
        Self::emit(&mut inner, &self.feed, task_id, vec![op]);
    }

    /// Merge history for an attempt, newest first.
    pub fn merges(&self, attempt_id: Uuid) -> Vec<Merge> {
        self.lock()
            .merges
            .get(&attempt_id)
            .cloned()
            .unwrap_or_default()
    }
}

/// Build a process record in `running` state.
pub fn new_running_process(
    attempt_id: Uuid,
    run_reason: model::RunReason,
    action: model::ExecutorAction,
    before_head_commit: Option<String>,
) -> ExecutionProcess {
    ExecutionProcess {
        id: model::new_id(),
        attempt_id,
        run_reason,
        status: ProcessStatus::Running,
        exit_code: None,
        dropped: false,
        action,
        before_head_commit,
        after_head_commit: None,
        started_at: Utc::now(),
        completed_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ExecutorProfileId;
    use model::{ExecutorActionType, RunReason, ScriptContext};

    fn script_action() -> model::ExecutorAction {
        model::ExecutorAction::new(
            ExecutorActionType::Script {
                script: "true".into(),
                context: ScriptContext::SetupScript,
            },
            None,
        )
    }

    fn seed(store: &StateStore) -> (Uuid, Uuid) {
        let task = Task::new("demo", None);
        let task_id = task.id;
        store.insert_task(task);
        let attempt = TaskAttempt {
            id: model::new_id(),
            task_id,
            branch: "attempt/demo".into(),
            base_branch: "main".into(),
            container_ref: Some("/tmp/wt".into()),
            executor_profile: ExecutorProfileId::new("claude-code"),
            worktree_deleted: false,
            created_at: Utc::now(),
        };
        let attempt_id = attempt.id;
        store.insert_attempt(attempt);
        (task_id, attempt_id)
    }

    #[test]
    fn drop_boundary_spares_target_and_earlier() {
        let store = StateStore::new();
        let (_, attempt_id) = seed(&store);
        let mut ids = Vec::new();
        for _ in 0..3 {
            let p = new_running_process(attempt_id, RunReason::CodingAgent, script_action(), None);
            ids.push(p.id);
            store.insert_process(p);
        }
        let dropped = store.drop_processes_after(attempt_id, ids[1]);
        assert_eq!(dropped, 1);
        assert!(!store.process(ids[0]).unwrap().dropped);
        assert!(!store.process(ids[1]).unwrap().dropped);
        assert!(store.process(ids[2]).unwrap().dropped);
    }

    #[test]
    fn latest_coding_agent_skips_dropped() {
        let store = StateStore::new();
        let (_, attempt_id) = seed(&store);
        let p1 = new_running_process(attempt_id, RunReason::CodingAgent, script_action(), None);
        let p2 = new_running_process(attempt_id, RunReason::CodingAgent, script_action(), None);
        let (id1, id2) = (p1.id, p2.id);
        store.insert_process(p1);
        store.insert_process(p2);
        store.drop_processes_after(attempt_id, id1);
        assert_eq!(store.latest_coding_agent(attempt_id).unwrap().id, id1);
        assert!(store.process(id2).unwrap().dropped);
    }

    #[test]
    fn exclusion_ignores_dev_servers() {
        let store = StateStore::new();
        let (task_id, attempt_id) = seed(&store);
        store.insert_process(new_running_process(
            attempt_id,
            RunReason::DevServer,
            script_action(),
            None,
        ));
        assert!(!store.attempt_busy(attempt_id));
        assert!(store.running_exclusive_for_task(task_id).is_empty());
        store.insert_process(new_running_process(
            attempt_id,
            RunReason::CodingAgent,
            script_action(),
            None,
        ));
        assert!(store.attempt_busy(attempt_id));
        assert_eq!(store.running_exclusive_for_task(task_id).len(), 1);
    }

    #[tokio::test]
    async fn subscribe_snapshot_then_gapless_patches() {
        let store = StateStore::new();
        let (task_id, _) = seed(&store);
        let (snapshot, mut sub) = store.subscribe(Scope::All);
        assert!(snapshot.tasks.contains_key(&task_id));
        let base = snapshot.seq;
        store.update_task_status(task_id, TaskStatus::InProgress);
        store.update_task_status(task_id, TaskStatus::InReview);
        assert_eq!(sub.recv().await.unwrap().seq, base + 1);
        assert_eq!(sub.recv().await.unwrap().seq, base + 2);
    }

    #[test]
    fn remove_task_cascades() {
        let store = StateStore::new();
        let (task_id, attempt_id) = seed(&store);
        let p = new_running_process(attempt_id, RunReason::CodingAgent, script_action(), None);
        let pid = p.id;
        store.insert_process(p);
        let removed = store.remove_task(task_id);
        assert_eq!(removed.len(), 1);
        assert!(store.task(task_id).is_none());
        assert!(store.attempt(attempt_id).is_none());
        assert!(store.process(pid).is_none());
    }
}
