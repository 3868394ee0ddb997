// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

pub mod git;
pub mod temp;

pub use git::{GitPublisher, GitWorktreeManager};
pub use temp::TempWorktreeManager;

use async_trait::async_trait;

use crate::errors::HarnessResult;

/// Best-effort publication of the integration branch as a pull request.
///
/// Failure never fails the run; the orchestrator records an event and
/// reports `completed` regardless.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Returns a human-meaningful reference to the created PR (URL or id).
    async fn publish(&self, target_branch: &str, base_branch: &str) -> HarnessResult<String>;
}
