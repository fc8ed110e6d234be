//! Process supervision: spawn, output capture, exit recording, stop.
//!
//! Every subprocess (script or coding-agent turn) runs under a waiter task
//! that owns the child, reads both output channels line by line into the
//! store's append-only log, and records the terminal outcome. `stop` is
//! cooperative first (SIGTERM), forceful after a grace period, and only
//! reports `Killed` once `wait()` has confirmed the exit.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::profile::ResolvedCommand;
use crate::store::model::{ExecutionProcess, LogChannel, LogEntry, ProcessStatus, RunReason};
use crate::store::StateStore;
use crate::worktree::WorktreeManager;

/// Carries the final status of a process once its waiter has recorded it.
pub type ExitSignal = watch::Receiver<Option<ProcessStatus>>;

/// Await the terminal status behind an exit signal.
pub async fn wait_exit(exit: &mut ExitSignal) -> Option<ProcessStatus> {
    loop {
        let current = *exit.borrow_and_update();
        if current.is_some() {
            return current;
        }
        if exit.changed().await.is_err() {
            return *exit.borrow();
        }
    }
}

struct ProcessHandle {
    pid: Option<u32>,
    stopping: Arc<AtomicBool>,
    force_kill: Arc<Notify>,
    exit: ExitSignal,
}

pub struct Supervisor {
    store: Arc<StateStore>,
    worktrees: Arc<WorktreeManager>,
    stop_grace: Duration,
    handles: Mutex<HashMap<Uuid, ProcessHandle>>,
}

impl Supervisor {
    pub fn new(store: Arc<StateStore>, worktrees: Arc<WorktreeManager>, stop_grace: Duration) -> Self {
        Self {
            store,
            worktrees,
            stop_grace,
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn handles(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, ProcessHandle>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn the command and insert `process` as its `running` record.
    ///
    /// The record only enters the store once the child exists: a launch
    /// failure returns `Spawn` and leaves no record behind.
    pub async fn spawn(
        self: &Arc<Self>,
        process: ExecutionProcess,
        cmd: &ResolvedCommand,
        cwd: &Path,
    ) -> Result<ExitSignal> {
        let process_id = process.id;
        let run_reason = process.run_reason;
        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| OrchestratorError::Spawn(format!("{}: {e}", cmd.program)))?;
        self.store.insert_process(process);

        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            readers.push(self.read_channel(process_id, run_reason, out, false));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(self.read_channel(process_id, run_reason, err, true));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let stopping = Arc::new(AtomicBool::new(false));
        let force_kill = Arc::new(Notify::new());
        self.handles().insert(
            process_id,
            ProcessHandle {
                pid: child.id(),
                stopping: stopping.clone(),
                force_kill: force_kill.clone(),
                exit: exit_rx.clone(),
            },
        );
        info!(process_id = %process_id, program = %cmd.program, pid = ?child.id(), "process spawned");

        let this = self.clone();
        let cwd = cwd.to_path_buf();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = force_kill.notified() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            for reader in readers {
                let _ = reader.await;
            }
            let (final_status, exit_code) = match status {
                Ok(status) => {
                    let code = status.code().map(i64::from);
                    let st = if stopping.load(Ordering::SeqCst) {
                        ProcessStatus::Killed
                    } else if status.success() {
                        ProcessStatus::Completed
                    } else {
                        ProcessStatus::Failed
                    };
                    (st, code)
                }
                Err(e) => {
                    warn!(process_id = %process_id, err = %e, "wait on child failed");
                    (ProcessStatus::Failed, None)
                }
            };
            // Coding-agent turns checkpoint the worktree HEAD at completion;
            // restore later resets to exactly this commit.
            let after_head = if run_reason == RunReason::CodingAgent {
                this.worktrees.head_oid(&cwd).await.ok()
            } else {
                None
            };
            this.store.update_process(process_id, |p| {
                p.status = final_status;
                p.exit_code = exit_code;
                p.completed_at = Some(Utc::now());
                if after_head.is_some() {
                    p.after_head_commit = after_head.clone();
                }
            });
            this.handles().remove(&process_id);
            debug!(process_id = %process_id, status = ?final_status, exit_code = ?exit_code, "process exited");
            let _ = exit_tx.send(Some(final_status));
        });

        Ok(exit_rx)
    }

    fn read_channel<R>(
        &self,
        process_id: Uuid,
        run_reason: RunReason,
        source: R,
        is_stderr: bool,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let store = self.store.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(source).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let channel = if is_stderr {
                    LogChannel::Stderr
                } else if run_reason == RunReason::CodingAgent && is_structured(&line) {
                    LogChannel::NormalizedEntry
                } else {
                    LogChannel::Stdout
                };
                store.append_log(process_id, LogEntry::new(channel, line));
            }
        })
    }

    /// Stop a running process: SIGTERM, grace period, then kill. Returns
    /// only after the waiter has recorded a terminal status. No-op success
    /// on an already-terminal process.
    pub async fn stop(&self, process_id: Uuid) -> Result<()> {
        match self.store.process(process_id) {
            Some(p) if p.status.is_terminal() => return Ok(()),
            Some(_) => {}
            None => return Err(OrchestratorError::not_found("process", process_id)),
        }
        let (pid, stopping, force_kill, mut exit) = {
            let handles = self.handles();
            match handles.get(&process_id) {
                Some(h) => (h.pid, h.stopping.clone(), h.force_kill.clone(), h.exit.clone()),
                // Reaped between the status check and here.
                None => return Ok(()),
            }
        };
        stopping.store(true, Ordering::SeqCst);
        terminate(pid);
        info!(process_id = %process_id, "termination requested; waiting for exit");
        if tokio::time::timeout(self.stop_grace, wait_exit(&mut exit))
            .await
            .is_err()
        {
            warn!(process_id = %process_id, "grace period expired; killing");
            force_kill.notify_one();
            wait_exit(&mut exit).await;
        }
        Ok(())
    }
}

/// Coding agents stream structured status events as JSON objects on stdout;
/// plain progress text stays on the raw channel.
fn is_structured(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with('{')
        && serde_json::from_str::<serde_json::Value>(trimmed)
            .map(|v| v.is_object())
            .unwrap_or(false)
}

#[cfg(unix)]
fn terminate(pid: Option<u32>) {
    if let Some(pid) = pid {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn terminate(_pid: Option<u32>) {
    warn!("cooperative termination is unsupported on this platform; escalating after grace period");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::model::{
        ExecutorAction, ExecutorActionType, ScriptContext, Task, TaskAttempt,
    };
    use crate::store::new_running_process;
    use tempfile::TempDir;

    fn fixture(tmp: &TempDir) -> (Arc<Supervisor>, Arc<StateStore>, Uuid) {
        let store = Arc::new(StateStore::new());
        let worktrees = Arc::new(WorktreeManager::new(&tmp.path().join("data")));
        let supervisor = Arc::new(Supervisor::new(
            store.clone(),
            worktrees,
            Duration::from_millis(300),
        ));
        let task = Task::new("demo", None);
        let task_id = task.id;
        store.insert_task(task);
        let attempt = TaskAttempt {
            id: crate::store::model::new_id(),
            task_id,
            branch: "attempt/demo".into(),
            base_branch: "main".into(),
            container_ref: Some(tmp.path().to_path_buf()),
            executor_profile: crate::profile::ExecutorProfileId::new("quick"),
            worktree_deleted: false,
            created_at: Utc::now(),
        };
        let attempt_id = attempt.id;
        store.insert_attempt(attempt);
        (supervisor, store, attempt_id)
    }

    fn script_record(attempt_id: Uuid, run_reason: RunReason) -> ExecutionProcess {
        let action = ExecutorAction::new(
            ExecutorActionType::Script {
                script: "unused".into(),
                context: ScriptContext::SetupScript,
            },
            None,
        );
        new_running_process(attempt_id, run_reason, action, None)
    }

    fn sh(script: &str) -> ResolvedCommand {
        ResolvedCommand {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    #[tokio::test]
    async fn records_exit_and_captures_both_channels() {
        let tmp = TempDir::new().unwrap();
        let (supervisor, store, attempt_id) = fixture(&tmp);
        let record = script_record(attempt_id, RunReason::SetupScript);
        let pid = record.id;
        let mut exit = supervisor
            .spawn(record, &sh("echo out-line; echo err-line >&2"), tmp.path())
            .await
            .unwrap();
        assert_eq!(wait_exit(&mut exit).await, Some(ProcessStatus::Completed));

        let record = store.process(pid).unwrap();
        assert_eq!(record.status, ProcessStatus::Completed);
        assert_eq!(record.exit_code, Some(0));
        assert!(record.completed_at.is_some());

        let log = store.log(pid);
        assert!(log
            .iter()
            .any(|e| e.channel == LogChannel::Stdout && e.content == "out-line"));
        assert!(log
            .iter()
            .any(|e| e.channel == LogChannel::Stderr && e.content == "err-line"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_failed_not_error() {
        let tmp = TempDir::new().unwrap();
        let (supervisor, store, attempt_id) = fixture(&tmp);
        let record = script_record(attempt_id, RunReason::SetupScript);
        let pid = record.id;
        let mut exit = supervisor
            .spawn(record, &sh("exit 3"), tmp.path())
            .await
            .unwrap();
        assert_eq!(wait_exit(&mut exit).await, Some(ProcessStatus::Failed));
        assert_eq!(store.process(pid).unwrap().exit_code, Some(3));
    }

    #[tokio::test]
    async fn agent_json_stdout_becomes_normalized_entries() {
        let tmp = TempDir::new().unwrap();
        let (supervisor, store, attempt_id) = fixture(&tmp);
        let record = script_record(attempt_id, RunReason::CodingAgent);
        let pid = record.id;
        let mut exit = supervisor
            .spawn(
                record,
                &sh(r#"echo '{"type":"error_message","message":"boom"}'; echo plain"#),
                tmp.path(),
            )
            .await
            .unwrap();
        wait_exit(&mut exit).await;

        let log = store.log(pid);
        assert!(log
            .iter()
            .any(|e| e.channel == LogChannel::NormalizedEntry && e.content.contains("error_message")));
        assert!(log
            .iter()
            .any(|e| e.channel == LogChannel::Stdout && e.content == "plain"));
    }

    #[tokio::test]
    async fn spawn_failure_leaves_no_record_behind() {
        let tmp = TempDir::new().unwrap();
        let (supervisor, store, attempt_id) = fixture(&tmp);
        let record = script_record(attempt_id, RunReason::SetupScript);
        let pid = record.id;
        let err = supervisor
            .spawn(
                record,
                &ResolvedCommand {
                    program: "no-such-binary-on-any-path".into(),
                    args: vec![],
                },
                tmp.path(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Spawn(_)));
        // A process that never launched must not appear in the store,
        // not even transiently as `running`.
        assert!(store.process(pid).is_none());
        assert!(store.processes_for_attempt(attempt_id).is_empty());
    }

    #[tokio::test]
    async fn stop_kills_and_returns_after_terminal_state() {
        let tmp = TempDir::new().unwrap();
        let (supervisor, store, attempt_id) = fixture(&tmp);
        let record = script_record(attempt_id, RunReason::CodingAgent);
        let pid = record.id;
        supervisor
            .spawn(record, &sh("sleep 30"), tmp.path())
            .await
            .unwrap();
        supervisor.stop(pid).await.unwrap();
        // stop() only returns after wait() confirmed the exit.
        let record = store.process(pid).unwrap();
        assert_eq!(record.status, ProcessStatus::Killed);
        assert!(record.completed_at.is_some());
        // Stopping again is a no-op success.
        supervisor.stop(pid).await.unwrap();
    }
}
