// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Durable pipeline snapshots.
//!
//! The checkpoint is the single source of truth for resume: every state
//! transition is persisted through `CheckpointManager::save`, which writes a
//! sibling temp file, fsyncs, and renames over the target so a crash at any
//! point leaves either the old snapshot or the new one, never a torn file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::errors::{HarnessError, HarnessResult};

/// Current checkpoint schema. Loaders reject anything else.
pub const SCHEMA_VERSION: u32 = 1;

/// Pipeline phase, shared between the live state machine and the
/// persisted checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Freezing,
    Decomposing,
    Implementing,
    Maintaining,
    Judging,
    Completed,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Freezing => "freezing",
            RunState::Decomposing => "decomposing",
            RunState::Implementing => "implementing",
            RunState::Maintaining => "maintaining",
            RunState::Judging => "judging",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
        }
    }
}

/// Per-bead progress accounting. The three lists are pairwise disjoint
/// subsets of the run bead set; the helpers below preserve that.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeadProgress {
    pub total: usize,
    #[serde(default)]
    pub completed: Vec<String>,
    #[serde(default)]
    pub in_progress: Vec<String>,
    #[serde(default)]
    pub blocked: Vec<String>,
    #[serde(default)]
    pub retry_counts: BTreeMap<String, u32>,
    #[serde(default)]
    pub claims: BTreeMap<String, String>,
}

impl BeadProgress {
    fn remove_everywhere(&mut self, id: &str) {
        self.completed.retain(|b| b != id);
        self.in_progress.retain(|b| b != id);
        self.blocked.retain(|b| b != id);
    }

    pub fn mark_in_progress(&mut self, id: &str) {
        self.remove_everywhere(id);
        self.in_progress.push(id.to_string());
    }

    pub fn mark_completed(&mut self, id: &str) {
        self.remove_everywhere(id);
        self.completed.push(id.to_string());
    }

    pub fn mark_blocked(&mut self, id: &str) {
        self.remove_everywhere(id);
        self.blocked.push(id.to_string());
    }

    /// Back to open: the bead leaves all three lists (retry path).
    pub fn mark_open(&mut self, id: &str) {
        self.remove_everywhere(id);
    }

    pub fn increment_retry(&mut self, id: &str) -> u32 {
        let count = self.retry_counts.entry(id.to_string()).or_insert(0);
        *count += 1;
        *count
    }
}

/// One live agent slot as recorded in the checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveAgent {
    pub agent_id: u64,
    pub bead_id: String,
    pub worktree: PathBuf,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Agent-pool bookkeeping persisted across crashes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRoster {
    pub max_concurrency: usize,
    #[serde(default)]
    pub active: Vec<ActiveAgent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceRunState {
    Running,
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceRun {
    pub id: u32,
    pub trigger_completed_count: usize,
    pub state: MaintenanceRunState,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceState {
    pub run_count: u32,
    #[serde(default)]
    pub runs: Vec<MaintenanceRun>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bead_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationState {
    #[serde(default)]
    pub pending: Vec<String>,
    #[serde(default)]
    pub promoted: Vec<String>,
    #[serde(default)]
    pub dismissed: Vec<String>,
}

/// The persisted pipeline snapshot, schema version 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub schema_version: u32,
    pub run_id: String,
    pub spec_path: PathBuf,
    pub frozen_spec_path: PathBuf,
    pub frozen_spec_sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptance_path: Option<PathBuf>,
    pub target_branch: String,
    pub base_branch: String,
    pub state: RunState,
    pub iteration: u32,
    pub beads: BeadProgress,
    pub agents: AgentRoster,
    pub maintenance: MaintenanceState,
    pub observations: ObservationState,
}

impl Checkpoint {
    pub fn new(run_id: String, spec_path: PathBuf, max_concurrency: usize) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            run_id,
            spec_path,
            frozen_spec_path: PathBuf::new(),
            frozen_spec_sha256: String::new(),
            acceptance_path: None,
            target_branch: String::new(),
            base_branch: String::new(),
            state: RunState::Freezing,
            iteration: 1,
            beads: BeadProgress::default(),
            agents: AgentRoster {
                max_concurrency,
                active: Vec::new(),
            },
            maintenance: MaintenanceState::default(),
            observations: ObservationState::default(),
        }
    }
}

/// Lowercase hex SHA-256 of a file's bytes.
pub async fn compute_file_hash(path: &Path) -> HarnessResult<String> {
    let bytes = tokio::fs::read(path).await.map_err(|err| {
        HarnessError::SpecNotFound(format!("{}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Re-read and compare; a mismatch means the frozen spec was mutated.
pub async fn verify_spec_hash(path: &Path, expected: &str) -> HarnessResult<()> {
    let actual = compute_file_hash(path).await?;
    if actual != expected {
        return Err(HarnessError::SpecHashMismatch(format!(
            "{}: expected {expected}, found {actual}",
            path.display()
        )));
    }
    Ok(())
}

/// Owns the checkpoint file; the only write path is `save`.
pub struct CheckpointManager {
    path: PathBuf,
    // No two saves may overlap on the temp file.
    write_serial: Mutex<()>,
}

impl CheckpointManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_serial: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut os = self.path.as_os_str().to_owned();
        os.push(".tmp");
        PathBuf::from(os)
    }

    /// Atomic save: sibling temp file, fsync, rename over the target.
    pub async fn save(&self, checkpoint: &Checkpoint) -> HarnessResult<()> {
        let _guard = self.write_serial.lock().await;

        let yaml = serde_yaml::to_string(checkpoint)?;
        let tmp = self.tmp_path();

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(yaml.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Load and validate. Cleans up any leftover temp file from a crashed
    /// save before reading the real snapshot.
    pub async fn load(&self) -> HarnessResult<Checkpoint> {
        let tmp = self.tmp_path();
        if let Err(err) = tokio::fs::remove_file(&tmp).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                return Err(err.into());
            }
        }

        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|err| {
            HarnessError::CheckpointCorrupt(format!("{}: {err}", self.path.display()))
        })?;

        let value: serde_yaml::Value = serde_yaml::from_str(&raw).map_err(|err| {
            HarnessError::CheckpointCorrupt(format!("{}: {err}", self.path.display()))
        })?;

        let version = value
            .get("schemaVersion")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| {
                HarnessError::CheckpointCorrupt("checkpoint has no schemaVersion".into())
            })?;
        if version != u64::from(SCHEMA_VERSION) {
            return Err(HarnessError::CheckpointCorrupt(format!(
                "unknown schemaVersion {version}"
            )));
        }

        serde_yaml::from_value(value).map_err(|err| {
            HarnessError::CheckpointCorrupt(format!("{}: {err}", self.path.display()))
        })
    }
}
