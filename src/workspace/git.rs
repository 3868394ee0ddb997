// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Git-backed worktree manager and pull-request publisher.
//!
//! Every agent works in its own `git worktree` rooted under the run's
//! state directory, all derived from one integration branch. Worktree
//! paths are deterministic per bead so a retry lands back in the same
//! checkout with the previous attempt's progress intact.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::errors::{HarnessError, HarnessResult};
use crate::traits::WorktreeManager;
use crate::workspace::Publisher;

async fn run_git(repo_root: &Path, args: &[&str]) -> HarnessResult<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|err| HarnessError::ConfigInvalid(format!("failed to run git: {err}")))?;

    if !output.status.success() {
        return Err(HarnessError::ConfigInvalid(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

pub struct GitWorktreeManager {
    repo_root: PathBuf,
    worktrees_root: PathBuf,
    target_branch: String,
    base_branch: String,
}

impl GitWorktreeManager {
    pub fn new(
        repo_root: impl Into<PathBuf>,
        worktrees_root: impl Into<PathBuf>,
        target_branch: impl Into<String>,
        base_branch: impl Into<String>,
    ) -> Self {
        Self {
            repo_root: repo_root.into(),
            worktrees_root: worktrees_root.into(),
            target_branch: target_branch.into(),
            base_branch: base_branch.into(),
        }
    }

    async fn add_worktree(&self, name: &str) -> HarnessResult<PathBuf> {
        let path = self.worktrees_root.join(name);
        if path.is_dir() {
            debug!(path = %path.display(), "reusing existing worktree");
            return Ok(path);
        }
        tokio::fs::create_dir_all(&self.worktrees_root).await?;

        let path_str = path.display().to_string();
        run_git(
            &self.repo_root,
            &[
                "worktree",
                "add",
                "--detach",
                path_str.as_str(),
                self.target_branch.as_str(),
            ],
        )
        .await?;
        Ok(path)
    }

    async fn branch_exists(&self, branch: &str) -> bool {
        let reference = format!("refs/heads/{branch}");
        run_git(
            &self.repo_root,
            &["show-ref", "--verify", "--quiet", reference.as_str()],
        )
        .await
        .is_ok()
    }
}

#[async_trait]
impl WorktreeManager for GitWorktreeManager {
    async fn create_agent_worktree(&self, bead_id: &str) -> HarnessResult<PathBuf> {
        self.add_worktree(&format!("agent-{bead_id}")).await
    }

    async fn create_judge_worktree(&self, iteration: u32) -> HarnessResult<PathBuf> {
        self.add_worktree(&format!("judge-iter-{iteration}")).await
    }

    async fn create_maintenance_worktree(&self, run_index: u32) -> HarnessResult<PathBuf> {
        self.add_worktree(&format!("maintenance-{run_index}")).await
    }

    async fn remove_worktree(&self, path: &Path) -> HarnessResult<()> {
        let path_str = path.display().to_string();
        run_git(
            &self.repo_root,
            &["worktree", "remove", "--force", path_str.as_str()],
        )
        .await
        .map(|_| ())
    }

    async fn create_integration_branch(&self) -> HarnessResult<String> {
        if !self.branch_exists(&self.target_branch).await {
            run_git(
                &self.repo_root,
                &["branch", self.target_branch.as_str(), self.base_branch.as_str()],
            )
            .await?;
            info!(branch = %self.target_branch, base = %self.base_branch, "created integration branch");
        }
        Ok(self.target_branch.clone())
    }

    async fn worktree_is_clean(&self, path: &Path) -> HarnessResult<bool> {
        let path_str = path.display().to_string();
        let status = run_git(
            &self.repo_root,
            &["-C", path_str.as_str(), "status", "--porcelain"],
        )
        .await?;
        Ok(status.trim().is_empty())
    }
}

/// Publishes the integration branch through `git` + the `gh` CLI.
pub struct GitPublisher {
    repo_root: PathBuf,
    run_id: String,
}

impl GitPublisher {
    pub fn new(repo_root: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            repo_root: repo_root.into(),
            run_id: run_id.into(),
        }
    }
}

#[async_trait]
impl Publisher for GitPublisher {
    async fn publish(&self, target_branch: &str, base_branch: &str) -> HarnessResult<String> {
        run_git(&self.repo_root, &["fetch", "origin", base_branch]).await?;

        // Rebase the integration branch onto the fetched base; on conflict
        // fall back to a suffixed branch so the original is untouched.
        let upstream = format!("origin/{base_branch}");
        let push_branch = match run_git(
            &self.repo_root,
            &["rebase", upstream.as_str(), target_branch],
        )
        .await
        {
            Ok(_) => target_branch.to_string(),
            Err(err) => {
                debug!(error = %err, "rebase failed; publishing a -rebased branch");
                let _ = run_git(&self.repo_root, &["rebase", "--abort"]).await;
                let fallback = format!("{target_branch}-rebased");
                run_git(
                    &self.repo_root,
                    &["branch", "--force", fallback.as_str(), target_branch],
                )
                .await?;
                fallback
            }
        };

        run_git(
            &self.repo_root,
            &["push", "--force-with-lease", "origin", push_branch.as_str()],
        )
        .await?;

        let title = format!("spec run {}", self.run_id);
        let body = format!(
            "Automated implementation produced by run {}.",
            self.run_id
        );
        let output = Command::new("gh")
            .args([
                "pr",
                "create",
                "--base",
                base_branch,
                "--head",
                push_branch.as_str(),
                "--title",
                title.as_str(),
                "--body",
                body.as_str(),
            ])
            .current_dir(&self.repo_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|err| HarnessError::ConfigInvalid(format!("failed to run gh: {err}")))?;

        if !output.status.success() {
            return Err(HarnessError::ConfigInvalid(format!(
                "gh pr create failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
