//! attemptd — task-attempt execution orchestrator.
//!
//! Each task attempt gets an isolated git worktree on its own branch; the
//! coordinator runs setup scripts and coding-agent turns in it under the
//! supervisor, records every process with restore checkpoints, and projects
//! all state changes onto an ordered patch feed for subscribers.

use std::sync::Arc;

pub mod attempt;
pub mod config;
pub mod error;
pub mod events;
pub mod pr;
pub mod process;
pub mod profile;
pub mod store;
pub mod worktree;

#[cfg(test)]
pub(crate) mod test_support;

use attempt::Coordinator;
use config::OrchestratorConfig;
use pr::PullRequestProvider;
use process::Supervisor;
use store::StateStore;
use worktree::WorktreeManager;

/// Shared handles for one daemon instance.
pub struct AppContext {
    pub config: Arc<OrchestratorConfig>,
    pub store: Arc<StateStore>,
    pub worktrees: Arc<WorktreeManager>,
    pub supervisor: Arc<Supervisor>,
    pub coordinator: Arc<Coordinator>,
}

impl AppContext {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self::with_provider(config, None)
    }

    pub fn with_provider(
        config: OrchestratorConfig,
        pr: Option<Arc<dyn PullRequestProvider>>,
    ) -> Self {
        let config = Arc::new(config);
        let store = Arc::new(StateStore::new());
        let worktrees = Arc::new(WorktreeManager::new(&config.data_dir));
        let supervisor = Arc::new(Supervisor::new(
            store.clone(),
            worktrees.clone(),
            config.stop_grace,
        ));
        let profiles = Arc::new(config.registry());
        let coordinator = Arc::new(Coordinator::new(
            config.clone(),
            store.clone(),
            worktrees.clone(),
            supervisor.clone(),
            profiles,
            pr,
        ));
        Self {
            config,
            store,
            worktrees,
            supervisor,
            coordinator,
        }
    }
}
