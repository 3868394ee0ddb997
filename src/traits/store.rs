// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Interface over the external bead store.
//!
//! The store is a file-backed multi-writer hazard; implementations must
//! serialize their own invocations. The orchestrator only ever sees this
//! trait, which keeps the end-to-end tests on an in-memory double.

use async_trait::async_trait;

use crate::beads::{Bead, BeadKind, BeadStatus};
use crate::errors::HarnessResult;

#[async_trait]
pub trait BeadStore: Send + Sync {
    /// List beads, optionally filtered by labels (all must match) and status.
    async fn list(&self, labels: &[String], status: Option<BeadStatus>) -> HarnessResult<Vec<Bead>>;

    /// Fetch a single bead by id.
    async fn show(&self, id: &str) -> HarnessResult<Bead>;

    /// Create a bead; returns the new bead id.
    async fn create(&self, title: &str, kind: BeadKind, labels: &[String]) -> HarnessResult<String>;

    /// Set a bead's status.
    async fn update_status(&self, id: &str, status: BeadStatus) -> HarnessResult<()>;

    /// Close a bead, optionally recording a reason.
    async fn close(&self, id: &str, reason: Option<&str>) -> HarnessResult<()>;

    /// Add a label to a bead.
    async fn add_label(&self, id: &str, label: &str) -> HarnessResult<()>;

    /// Record "`dependent` depends on `dependency`"; the store stores the
    /// inverse blocking edge.
    async fn add_dependency(&self, dependent: &str, dependency: &str) -> HarnessResult<()>;

    /// Flush the store's own sync mechanism.
    async fn sync(&self) -> HarnessResult<()>;
}
