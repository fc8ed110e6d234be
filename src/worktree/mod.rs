//! Per-attempt Git worktree management.

pub mod manager;

pub use manager::WorktreeManager;
