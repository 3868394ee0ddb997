// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Interface over the version-control workspace manager.
//!
//! Agents never touch the base checkout; each gets an isolated worktree on
//! an independent filesystem subtree, all pushing toward one integration
//! branch. Only the directory-path contract matters to the core.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::errors::HarnessResult;

#[async_trait]
pub trait WorktreeManager: Send + Sync {
    /// Create (or reuse, on retry) the isolated checkout for one bead.
    async fn create_agent_worktree(&self, bead_id: &str) -> HarnessResult<PathBuf>;

    /// Create the read-only checkout handed to the judge.
    async fn create_judge_worktree(&self, iteration: u32) -> HarnessResult<PathBuf>;

    /// Create the checkout for one maintenance run.
    async fn create_maintenance_worktree(&self, run_index: u32) -> HarnessResult<PathBuf>;

    /// Tear down a worktree. Failure is recoverable; callers log and move on.
    async fn remove_worktree(&self, path: &Path) -> HarnessResult<()>;

    /// Ensure the integration branch exists; returns its name.
    async fn create_integration_branch(&self) -> HarnessResult<String>;

    /// True when the worktree has no local modifications. Used for the
    /// judge integrity check.
    async fn worktree_is_clean(&self, path: &Path) -> HarnessResult<bool>;
}
