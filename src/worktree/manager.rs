//! Per-attempt Git worktree manager.
//!
//! Every attempt gets its own worktree isolated from the main checkout.
//! Worktrees live at `{data_dir}/worktrees/{attempt_id}/` and are branched
//! as `attempt/{short-id}-{slug}` from the attempt's base branch. All git2
//! work runs on the blocking pool.

use std::path::{Path, PathBuf};

use git2::{build::CheckoutBuilder, BranchType, Repository, ResetType, StatusOptions};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::store::model::{BranchStatus, Merge};

// ─── Manager ─────────────────────────────────────────────────────────────────

pub struct WorktreeManager {
    /// Base directory for all worktrees: `{data_dir}/worktrees/`.
    worktree_base: PathBuf,
}

impl WorktreeManager {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            worktree_base: data_dir.join("worktrees"),
        }
    }

    /// Branch name for a new attempt: `attempt/{first-8-of-id}-{slug}`.
    pub fn branch_name(attempt_id: Uuid, task_title: &str) -> String {
        let id = attempt_id.to_string();
        let short = id.split('-').next().unwrap_or(&id).to_string();
        let slug = make_slug(task_title);
        if slug.is_empty() {
            format!("attempt/{short}")
        } else {
            format!("attempt/{short}-{slug}")
        }
    }

    /// Create a fresh worktree for an attempt, branched from `base_branch`.
    ///
    /// Fails with a `Vcs` error when the base ref cannot be resolved or the
    /// branch already exists.
    pub async fn create(
        &self,
        repo_path: &Path,
        base_branch: &str,
        attempt_branch: &str,
        attempt_id: Uuid,
    ) -> Result<PathBuf> {
        let wt_path = self.worktree_base.join(attempt_id.to_string());
        tokio::fs::create_dir_all(&self.worktree_base)
            .await
            .map_err(|e| OrchestratorError::Vcs(format!("cannot create worktree base: {e}")))?;

        let repo_path = repo_path.to_path_buf();
        let base = base_branch.to_string();
        let branch = attempt_branch.to_string();
        let path = wt_path.clone();
        run_git(move || create_worktree_blocking(&repo_path, &base, &branch, &path)).await?;

        info!(attempt_id = %attempt_id, branch = %attempt_branch, path = %wt_path.display(), "worktree created");
        Ok(wt_path)
    }

    /// Compute the derived branch status. `merges` is the attempt's recorded
    /// merge history (direct commits + PR records from the provider).
    pub async fn status(
        &self,
        worktree_path: &Path,
        branch: &str,
        base_branch: &str,
        merges: Vec<Merge>,
    ) -> Result<BranchStatus> {
        let wt = worktree_path.to_path_buf();
        let branch = branch.to_string();
        let base = base_branch.to_string();
        let mut status =
            run_git(move || branch_status_blocking(&wt, &branch, &base)).await?;
        status.merges = merges;
        Ok(status)
    }

    /// Replay the attempt branch's unique commits onto the tip of
    /// `new_base_branch`. Rewrites commit identities. On conflict the
    /// worktree is left conflicted for the caller to surface.
    pub async fn rebase(
        &self,
        worktree_path: &Path,
        branch: &str,
        old_base_branch: &str,
        new_base_branch: &str,
    ) -> Result<()> {
        let wt = worktree_path.to_path_buf();
        let branch = branch.to_string();
        let old_base = old_base_branch.to_string();
        let new_base = new_base_branch.to_string();
        run_git(move || rebase_blocking(&wt, &branch, &old_base, &new_base)).await
    }

    /// Squash every attempt-branch commit into one commit applied to the
    /// base branch, locally only. Returns the new commit id.
    pub async fn merge(
        &self,
        repo_path: &Path,
        branch: &str,
        base_branch: &str,
        message: &str,
    ) -> Result<String> {
        let repo = repo_path.to_path_buf();
        let branch = branch.to_string();
        let base = base_branch.to_string();
        let message = message.to_string();
        run_git(move || squash_merge_blocking(&repo, &branch, &base, &message)).await
    }

    /// Hard-reset the worktree to a historical commit. Refuses to discard
    /// uncommitted changes unless `force_if_dirty` is set.
    pub async fn reset_to_commit(
        &self,
        worktree_path: &Path,
        commit: &str,
        force_if_dirty: bool,
    ) -> Result<()> {
        let wt = worktree_path.to_path_buf();
        let commit = commit.to_string();
        run_git(move || reset_blocking(&wt, &commit, force_if_dirty)).await
    }

    /// Remove the isolated working copy. Idempotent — a missing path is
    /// not an error. The branch is left behind.
    pub async fn destroy(&self, repo_path: &Path, worktree_path: &Path) -> Result<()> {
        let repo = repo_path.to_path_buf();
        let wt = worktree_path.to_path_buf();
        let result = run_git(move || remove_worktree_blocking(&repo, &wt)).await;
        if let Err(e) = result {
            warn!(path = %worktree_path.display(), err = %e, "git worktree removal failed — cleaning directory manually");
            if worktree_path.exists() {
                tokio::fs::remove_dir_all(worktree_path).await.ok();
            }
        }
        debug!(path = %worktree_path.display(), "worktree removed");
        Ok(())
    }

    /// Worktree HEAD commit id, used for process checkpoints.
    pub async fn head_oid(&self, worktree_path: &Path) -> Result<String> {
        let wt = worktree_path.to_path_buf();
        run_git(move || head_oid_blocking(&wt)).await
    }

    /// Whether the worktree has no uncommitted (tracked or untracked) changes.
    pub async fn is_clean(&self, worktree_path: &Path) -> Result<bool> {
        let wt = worktree_path.to_path_buf();
        run_git(move || change_counts_blocking(&wt).map(|(c, u)| c == 0 && u == 0)).await
    }

    /// The branch currently checked out in the main repository, if any.
    pub async fn current_branch(&self, repo_path: &Path) -> Result<Option<String>> {
        let repo = repo_path.to_path_buf();
        run_git(move || current_branch_blocking(&repo)).await
    }
}

async fn run_git<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| OrchestratorError::Vcs(format!("git task panicked: {e}")))?
}

// ─── Blocking git2 helpers ───────────────────────────────────────────────────

fn make_slug(title: &str) -> String {
    title
        .chars()
        .filter(|c| c.is_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .take(8)
        .collect()
}

fn resolve_branch_commit<'r>(
    repo: &'r Repository,
    branch: &str,
) -> Result<git2::Commit<'r>> {
    let reference = repo
        .find_branch(branch, BranchType::Local)
        .map(|b| b.into_reference())
        .or_else(|_| repo.find_reference(&format!("refs/remotes/{branch}")))
        .map_err(|_| OrchestratorError::Vcs(format!("cannot resolve branch '{branch}'")))?;
    reference
        .peel_to_commit()
        .map_err(|e| OrchestratorError::Vcs(format!("branch '{branch}' has no commit: {e}")))
}

fn create_worktree_blocking(
    repo_path: &Path,
    base_branch: &str,
    attempt_branch: &str,
    wt_path: &Path,
) -> Result<()> {
    let repo = Repository::open(repo_path)?;
    let base_commit = resolve_branch_commit(&repo, base_branch)?;

    if repo.find_branch(attempt_branch, BranchType::Local).is_ok() {
        return Err(OrchestratorError::Vcs(format!(
            "branch '{attempt_branch}' already exists"
        )));
    }
    let branch = repo.branch(attempt_branch, &base_commit, false)?;

    // Worktree names may not contain '/', so derive one from the branch.
    let wt_name = attempt_branch.replace('/', "--");
    let mut opts = git2::WorktreeAddOptions::new();
    opts.reference(Some(branch.get()));
    repo.worktree(&wt_name, wt_path, Some(&opts))?;
    Ok(())
}

fn remove_worktree_blocking(repo_path: &Path, wt_path: &Path) -> Result<()> {
    let repo = Repository::open(repo_path)?;
    let names = repo.worktrees()?;
    for name in names.iter().flatten() {
        if let Ok(wt) = repo.find_worktree(name) {
            if wt.path() == wt_path {
                wt.prune(Some(
                    git2::WorktreePruneOptions::new().valid(true).working_tree(true),
                ))?;
                if wt_path.exists() {
                    std::fs::remove_dir_all(wt_path)
                        .map_err(|e| OrchestratorError::Vcs(format!("remove worktree dir: {e}")))?;
                }
                return Ok(());
            }
        }
    }
    // Not registered — just clean up any leftover directory.
    if wt_path.exists() {
        std::fs::remove_dir_all(wt_path)
            .map_err(|e| OrchestratorError::Vcs(format!("remove orphaned worktree dir: {e}")))?;
    }
    Ok(())
}

fn head_oid_blocking(wt_path: &Path) -> Result<String> {
    let repo = Repository::open(wt_path)?;
    let head = repo.head()?.peel_to_commit()?;
    Ok(head.id().to_string())
}

fn current_branch_blocking(repo_path: &Path) -> Result<Option<String>> {
    let repo = Repository::open(repo_path)?;
    let head = match repo.head() {
        Ok(h) => h,
        Err(_) => return Ok(None),
    };
    if head.is_branch() {
        Ok(head.shorthand().map(|s| s.to_string()))
    } else {
        Ok(None)
    }
}

/// (tracked changes, untracked files) in the worktree.
fn change_counts_blocking(wt_path: &Path) -> Result<(usize, usize)> {
    let repo = Repository::open(wt_path)?;
    let mut opts = StatusOptions::new();
    opts.include_untracked(true)
        .include_ignored(false)
        .recurse_untracked_dirs(true);
    let statuses = repo.statuses(Some(&mut opts))?;
    let mut changed = 0;
    let mut untracked = 0;
    for entry in statuses.iter() {
        if entry.status().is_wt_new() {
            untracked += 1;
        } else {
            changed += 1;
        }
    }
    Ok((changed, untracked))
}

fn branch_status_blocking(wt_path: &Path, branch: &str, base_branch: &str) -> Result<BranchStatus> {
    let repo = Repository::open(wt_path)?;

    let head_oid = repo
        .head()
        .ok()
        .and_then(|h| h.peel_to_commit().ok())
        .map(|c| c.id().to_string());

    let (uncommitted_count, untracked_count) = change_counts_blocking(wt_path)?;
    let has_uncommitted_changes = uncommitted_count > 0 || untracked_count > 0;

    let branch_oid = resolve_branch_commit(&repo, branch)?.id();
    let (commits_ahead, commits_behind) = match resolve_branch_commit(&repo, base_branch) {
        Ok(base_commit) => {
            let (a, b) = repo.graph_ahead_behind(branch_oid, base_commit.id())?;
            (Some(a), Some(b))
        }
        Err(_) => (None, None),
    };

    // Remote comparison uses the tracking ref if one exists; no network.
    let (remote_commits_ahead, remote_commits_behind) =
        match repo.find_reference(&format!("refs/remotes/origin/{branch}")) {
            Ok(r) => {
                let remote_oid = r.peel_to_commit()?.id();
                let (a, b) = repo.graph_ahead_behind(branch_oid, remote_oid)?;
                (Some(a), Some(b))
            }
            Err(_) => (None, None),
        };

    Ok(BranchStatus {
        commits_ahead,
        commits_behind,
        remote_commits_ahead,
        remote_commits_behind,
        has_uncommitted_changes: Some(has_uncommitted_changes),
        head_oid,
        uncommitted_count: Some(uncommitted_count),
        untracked_count: Some(untracked_count),
        base_branch_name: base_branch.to_string(),
        merges: Vec::new(),
    })
}

fn rebase_blocking(wt_path: &Path, branch: &str, old_base: &str, new_base: &str) -> Result<()> {
    let repo = Repository::open(wt_path)?;

    let branch_ref = repo
        .find_branch(branch, BranchType::Local)
        .map_err(|_| OrchestratorError::Vcs(format!("cannot resolve branch '{branch}'")))?;
    let branch_annotated = repo.reference_to_annotated_commit(branch_ref.get())?;
    let upstream_commit = resolve_branch_commit(&repo, old_base)?;
    let upstream_annotated = repo.find_annotated_commit(upstream_commit.id())?;
    let onto_commit = resolve_branch_commit(&repo, new_base)?;
    let onto_annotated = repo.find_annotated_commit(onto_commit.id())?;

    let mut rebase = repo.rebase(
        Some(&branch_annotated),
        Some(&upstream_annotated),
        Some(&onto_annotated),
        None,
    )?;

    let committer = repo.signature()?;
    while let Some(op) = rebase.next() {
        op?;
        if repo.index()?.has_conflicts() {
            // Leave the conflicted state in place for the user; never
            // auto-resolve or abort behind their back.
            return Err(OrchestratorError::Conflict {
                path: wt_path.display().to_string(),
                detail: format!("rebase of '{branch}' onto '{new_base}' hit conflicts"),
            });
        }
        match rebase.commit(None, &committer, None) {
            Ok(_) => {}
            // Patch already applied upstream — skip it.
            Err(e) if e.code() == git2::ErrorCode::Applied => {}
            Err(e) => return Err(e.into()),
        }
    }
    rebase.finish(Some(&committer))?;
    Ok(())
}

fn squash_merge_blocking(
    repo_path: &Path,
    branch: &str,
    base_branch: &str,
    message: &str,
) -> Result<String> {
    let repo = Repository::open(repo_path)?;
    let branch_commit = resolve_branch_commit(&repo, branch)?;
    let base_commit = resolve_branch_commit(&repo, base_branch)?;

    let (ahead, behind) = repo.graph_ahead_behind(branch_commit.id(), base_commit.id())?;
    if ahead == 0 {
        return Err(OrchestratorError::Vcs(format!(
            "branch '{branch}' has no commits ahead of '{base_branch}'"
        )));
    }
    if behind > 0 {
        return Err(OrchestratorError::Conflict {
            path: repo_path.display().to_string(),
            detail: format!(
                "branch '{branch}' is {behind} commits behind '{base_branch}'; rebase first"
            ),
        });
    }

    // Squash: one commit on base carrying the attempt branch's final tree.
    let tree = branch_commit.tree()?;
    let sig = repo.signature()?;
    let oid = repo.commit(
        Some(&format!("refs/heads/{base_branch}")),
        &sig,
        &sig,
        message,
        &tree,
        &[&base_commit],
    )?;
    // Converge the attempt branch on the squash commit so ahead/behind
    // recomputes to (0, 0). The trees are identical, so the attempt
    // worktree stays clean.
    let mut attempt_branch = repo.find_branch(branch, BranchType::Local)?;
    attempt_branch.get_mut().set_target(oid, "squash merge")?;
    Ok(oid.to_string())
}

fn reset_blocking(wt_path: &Path, commit: &str, force_if_dirty: bool) -> Result<()> {
    let repo = Repository::open(wt_path)?;
    let (changed, untracked) = change_counts_blocking(wt_path)?;
    if (changed > 0 || untracked > 0) && !force_if_dirty {
        return Err(OrchestratorError::DirtyWorktree);
    }
    let oid = git2::Oid::from_str(commit)
        .map_err(|_| OrchestratorError::Vcs(format!("invalid commit id '{commit}'")))?;
    let object = repo
        .find_object(oid, None)
        .map_err(|_| OrchestratorError::Vcs(format!("commit '{commit}' not found")))?;
    let mut checkout = CheckoutBuilder::new();
    checkout.force().remove_untracked(true);
    repo.reset(&object, ResetType::Hard, Some(&mut checkout))?;
    // A hard reset leaves untracked files in place; sweep them with an
    // explicit checkout so the worktree really matches the commit.
    let mut sweep = CheckoutBuilder::new();
    sweep.force().remove_untracked(true);
    repo.checkout_head(Some(&mut sweep))?;
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
