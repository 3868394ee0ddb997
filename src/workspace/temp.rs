// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Plain-directory worktree manager.
//!
//! Backs dry runs and the end-to-end tests: worktrees are empty
//! directories, and "clean" means the directory still has no entries.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::errors::HarnessResult;
use crate::traits::WorktreeManager;

pub struct TempWorktreeManager {
    root: PathBuf,
    target_branch: String,
}

impl TempWorktreeManager {
    pub fn new(root: impl Into<PathBuf>, target_branch: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            target_branch: target_branch.into(),
        }
    }

    async fn make_dir(&self, name: &str) -> HarnessResult<PathBuf> {
        let path = self.root.join(name);
        tokio::fs::create_dir_all(&path).await?;
        Ok(path)
    }
}

#[async_trait]
impl WorktreeManager for TempWorktreeManager {
    async fn create_agent_worktree(&self, bead_id: &str) -> HarnessResult<PathBuf> {
        self.make_dir(&format!("agent-{bead_id}")).await
    }

    async fn create_judge_worktree(&self, iteration: u32) -> HarnessResult<PathBuf> {
        self.make_dir(&format!("judge-iter-{iteration}")).await
    }

    async fn create_maintenance_worktree(&self, run_index: u32) -> HarnessResult<PathBuf> {
        self.make_dir(&format!("maintenance-{run_index}")).await
    }

    async fn remove_worktree(&self, path: &Path) -> HarnessResult<()> {
        tokio::fs::remove_dir_all(path).await?;
        Ok(())
    }

    async fn create_integration_branch(&self) -> HarnessResult<String> {
        Ok(self.target_branch.clone())
    }

    async fn worktree_is_clean(&self, path: &Path) -> HarnessResult<bool> {
        let mut entries = tokio::fs::read_dir(path).await?;
        Ok(entries.next_entry().await?.is_none())
    }
}
