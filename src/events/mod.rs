//! Change feed: ordered incremental patches pushed to subscribers.
//!
//! The state store emits one `Patch` per mutation, numbered by a gapless
//! sequence counter assigned under the store's write lock, so a subscriber
//! that applies patches in `seq` order reconstructs exact current state.
//! Fan-out rides a `tokio::sync::broadcast` channel; each subscriber gets an
//! independent, identically-ordered feed. There is no resumable cursor — a
//! reconnecting subscriber takes a fresh snapshot.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::store::model::{ExecutionProcess, LogEntry, Merge, Task, TaskAttempt};

/// Channel capacity. A subscriber that lags this far behind is dropped and
/// must resubscribe for a fresh snapshot.
const FEED_CAPACITY: usize = 1024;

// ─── Patch types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchOp {
    Add {
        path: String,
        value: serde_json::Value,
    },
    Replace {
        path: String,
        value: serde_json::Value,
    },
    Remove {
        path: String,
    },
}

impl PatchOp {
    pub fn path(&self) -> &str {
        match self {
            PatchOp::Add { path, .. }
            | PatchOp::Replace { path, .. }
            | PatchOp::Remove { path } => path,
        }
    }
}

/// One mutation's worth of patch operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patch {
    pub seq: u64,
    /// Task this mutation belongs to; None for task-table mutations that
    /// have no narrower scope.
    pub task_id: Option<Uuid>,
    pub ops: Vec<PatchOp>,
}

/// Full state at a point in the feed. `seq` is the last patch already folded
/// in; the first live patch a subscriber should apply is `seq + 1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub seq: u64,
    pub tasks: HashMap<Uuid, Task>,
    pub attempts: HashMap<Uuid, TaskAttempt>,
    pub processes: HashMap<Uuid, ExecutionProcess>,
    pub merges: HashMap<Uuid, Vec<Merge>>,
    pub logs: HashMap<Uuid, Vec<LogEntry>>,
}

// ─── Scope ───────────────────────────────────────────────────────────────────

/// What a subscriber wants to observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Everything (project-wide feed).
    All,
    /// A single task and its attempts/processes.
    Task(Uuid),
}

impl Scope {
    fn matches(self, patch: &Patch) -> bool {
        match self {
            Scope::All => true,
            // Patches whose mutation cannot be pinned to a task stay
            // project-wide; task mutations always carry their own id, so a
            // task-scoped feed still sees its status flips.
            Scope::Task(id) => patch.task_id == Some(id),
        }
    }
}

// ─── Broadcaster ─────────────────────────────────────────────────────────────

/// Fans patches out to all connected subscribers.
#[derive(Clone)]
pub struct FeedBroadcaster {
    tx: broadcast::Sender<Patch>,
}

impl Default for FeedBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self { tx }
    }

    /// Send a patch to all subscribers. No subscribers is fine.
    pub fn broadcast(&self, patch: Patch) {
        let _ = self.tx.send(patch);
    }

    pub fn subscribe(&self, scope: Scope) -> FeedSubscription {
        FeedSubscription {
            rx: self.tx.subscribe(),
            scope,
        }
    }
}

/// A live, scope-filtered patch stream.
pub struct FeedSubscription {
    rx: broadcast::Receiver<Patch>,
    scope: Scope,
}

impl FeedSubscription {
    /// Next in-scope patch, or None once the feed is closed or this
    /// subscriber lagged past the channel capacity.
    pub async fn recv(&mut self) -> Option<Patch> {
        loop {
            match self.rx.recv().await {
                Ok(patch) if self.scope.matches(&patch) => return Some(patch),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "feed subscriber lagged; resubscribe for a snapshot");
                    return None;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch(seq: u64, task_id: Option<Uuid>) -> Patch {
        Patch {
            seq,
            task_id,
            ops: vec![PatchOp::Remove {
                path: format!("/tasks/{seq}"),
            }],
        }
    }

    #[tokio::test]
    async fn patches_arrive_in_broadcast_order() {
        let feed = FeedBroadcaster::new();
        let mut sub = feed.subscribe(Scope::All);
        for seq in 1..=5 {
            feed.broadcast(patch(seq, None));
        }
        for seq in 1..=5 {
            assert_eq!(sub.recv().await.unwrap().seq, seq);
        }
    }

    #[tokio::test]
    async fn task_scope_filters_other_tasks() {
        let feed = FeedBroadcaster::new();
        let mine = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut sub = feed.subscribe(Scope::Task(mine));
        feed.broadcast(patch(1, Some(other)));
        feed.broadcast(patch(2, Some(mine)));
        feed.broadcast(patch(3, None));
        feed.broadcast(patch(4, Some(mine)));
        // Neither another task's patches nor unowned project-wide ones leak
        // into a task-scoped feed.
        assert_eq!(sub.recv().await.unwrap().seq, 2);
        assert_eq!(sub.recv().await.unwrap().seq, 4);
    }

    #[tokio::test]
    async fn independent_subscribers_see_identical_feeds() {
        let feed = FeedBroadcaster::new();
        let mut a = feed.subscribe(Scope::All);
        let mut b = feed.subscribe(Scope::All);
        feed.broadcast(patch(1, None));
        feed.broadcast(patch(2, None));
        assert_eq!(a.recv().await.unwrap().seq, 1);
        assert_eq!(b.recv().await.unwrap().seq, 1);
        assert_eq!(a.recv().await.unwrap().seq, 2);
        assert_eq!(b.recv().await.unwrap().seq, 2);
    }
}
