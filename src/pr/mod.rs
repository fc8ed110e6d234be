//! Pull-request provider seam.
//!
//! Branch status classification consumes recorded merges plus whatever the
//! configured provider reports for the attempt branch. Live forge clients
//! plug in behind the trait; tests use the in-memory table.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::Result;
use crate::store::model::{PrStatus, PullRequestInfo};

#[async_trait]
pub trait PullRequestProvider: Send + Sync {
    /// The open pull request for `branch`, if one exists.
    async fn find_open_pr(&self, branch: &str) -> Result<Option<PullRequestInfo>>;
}

/// Fixed branch → PR table.
#[derive(Default)]
pub struct InMemoryPrProvider {
    prs: Mutex<HashMap<String, PullRequestInfo>>,
}

impl InMemoryPrProvider {
    pub fn set(&self, branch: impl Into<String>, info: PullRequestInfo) {
        self.prs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(branch.into(), info);
    }
}

#[async_trait]
impl PullRequestProvider for InMemoryPrProvider {
    async fn find_open_pr(&self, branch: &str) -> Result<Option<PullRequestInfo>> {
        Ok(self
            .prs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(branch)
            .filter(|info| info.status == PrStatus::Open)
            .cloned())
    }
}
