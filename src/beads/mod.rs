// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Bead data model and the serialized CLI store client.
//!
//! A bead is one tracked unit of work in the external issue tracker. The
//! core never owns bead storage; it consumes the tracker's CLI surface and
//! treats bead IDs as stable string handles.

mod store;

pub use store::CliBeadStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Dependency type recorded on the blocker side: B with `{blocks, A}`
/// means "B blocks A".
pub const DEP_TYPE_BLOCKS: &str = "blocks";

/// Label marking a bead as an incidental observation for judge triage.
pub const OBSERVATION_LABEL: &str = "observation";

/// Label marking a bead as judge-created remediation work.
pub const REMEDIATION_LABEL: &str = "remediation";

/// Label marking a bead as a maintenance-run tracking bead.
pub const MAINTENANCE_LABEL: &str = "maintenance";

/// The well-known label scoping a bead to one run.
pub fn run_label(run_id: &str) -> String {
    format!("compiler-run:{run_id}")
}

/// Work classification for a bead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BeadKind {
    #[default]
    Task,
    Bug,
    Feature,
    Epic,
}

impl BeadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BeadKind::Task => "task",
            BeadKind::Bug => "bug",
            BeadKind::Feature => "feature",
            BeadKind::Epic => "epic",
        }
    }
}

/// Lifecycle status as the store reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BeadStatus {
    #[default]
    Open,
    InProgress,
    Closed,
    Blocked,
}

impl BeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BeadStatus::Open => "open",
            BeadStatus::InProgress => "in_progress",
            BeadStatus::Closed => "closed",
            BeadStatus::Blocked => "blocked",
        }
    }
}

/// One dependency edge, recorded on the blocker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeadDependency {
    #[serde(rename = "type")]
    pub dep_type: String,
    pub target: String,
}

/// One tracked unit of work (issue/ticket), as consumed from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bead {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub kind: BeadKind,
    #[serde(default)]
    pub status: BeadStatus,
    /// Lower number means higher priority.
    #[serde(default)]
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<BeadDependency>,
}

impl Bead {
    /// IDs this bead blocks, i.e. the forward edges it contributes.
    pub fn blocks_targets(&self) -> impl Iterator<Item = &str> {
        self.dependencies
            .iter()
            .filter(|d| d.dep_type == DEP_TYPE_BLOCKS)
            .map(|d| d.target.as_str())
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}
