//! Helpers for tests that need real repositories in temp directories.

use std::path::Path;

use git2::{Repository, Signature};

/// Initialize a repository at `path` with `main` checked out and one commit.
pub fn init_repo(path: &Path) {
    std::fs::create_dir_all(path).unwrap();
    let mut opts = git2::RepositoryInitOptions::new();
    opts.initial_head("refs/heads/main");
    let repo = Repository::init_opts(path, &opts).unwrap();
    let mut config = repo.config().unwrap();
    config.set_str("user.name", "tester").unwrap();
    config.set_str("user.email", "tester@example.com").unwrap();
    drop(config);
    drop(repo);
    commit_file(path, "README.md", "seed", "initial commit");
}

/// Write `name` with `content` in the checkout at `repo_path` (main repo or
/// worktree) and commit it to the current branch.
pub fn commit_file(repo_path: &Path, name: &str, content: &str, message: &str) {
    let repo = Repository::open(repo_path).unwrap();
    let workdir = repo.workdir().unwrap().to_path_buf();
    std::fs::write(workdir.join(name), content).unwrap();
    let mut index = repo.index().unwrap();
    index.add_path(Path::new(name)).unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = repo
        .signature()
        .unwrap_or_else(|_| Signature::now("tester", "tester@example.com").unwrap());
    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
        .unwrap();
}
