// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Human-readable run summary, mirrored to YAML after every iteration.
//!
//! This file exists for people; the event log is the machine record. Write
//! failures are logged and otherwise ignored.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Per-iteration counters plus a compact judge summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationSummary {
    pub iteration: u32,
    pub beads_total: usize,
    pub beads_completed: usize,
    pub beads_failed: usize,
    pub beads_blocked: usize,
    pub agents_spawned: u64,
    pub maintenance_runs: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge: Option<String>,
}

/// The whole run-log document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLog {
    pub run_id: String,
    pub spec_path: PathBuf,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub iterations: Vec<IterationSummary>,
}

impl RunLog {
    pub fn new(run_id: String, spec_path: PathBuf) -> Self {
        Self {
            run_id,
            spec_path,
            started_at: Utc::now(),
            ended_at: None,
            status: None,
            iterations: Vec::new(),
        }
    }

    /// Replace or append the summary for one iteration.
    pub fn record_iteration(&mut self, summary: IterationSummary) {
        if let Some(existing) = self
            .iterations
            .iter_mut()
            .find(|s| s.iteration == summary.iteration)
        {
            *existing = summary;
        } else {
            self.iterations.push(summary);
        }
    }

    pub fn finish(&mut self, status: &str) {
        self.ended_at = Some(Utc::now());
        self.status = Some(status.to_string());
    }
}

/// Best-effort YAML writer for the run log.
pub struct RunLogWriter {
    path: PathBuf,
}

impl RunLogWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn write(&self, log: &RunLog) {
        let yaml = match serde_yaml::to_string(log) {
            Ok(yaml) => yaml,
            Err(err) => {
                warn!(error = %err, "run log serialization failed");
                return;
            }
        };
        if let Err(err) = tokio::fs::write(&self.path, yaml).await {
            warn!(error = %err, path = %self.path.display(), "run log write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_readable_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run-log.yml");
        let writer = RunLogWriter::new(&path);

        let mut log = RunLog::new("run-2025-11-03-abcdef".into(), PathBuf::from("/spec.md"));
        log.record_iteration(IterationSummary {
            iteration: 1,
            beads_total: 4,
            beads_completed: 3,
            beads_failed: 1,
            beads_blocked: 1,
            agents_spawned: 6,
            maintenance_runs: 1,
            judge: Some("FAIL: 1 new bead".into()),
        });
        log.finish("completed");
        writer.write(&log).await;

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("runId: run-2025-11-03-abcdef"));
        assert!(raw.contains("beadsCompleted: 3"));
        assert!(raw.contains("agentsSpawned: 6"));
        assert!(raw.contains("status: completed"));
    }

    #[test]
    fn record_iteration_replaces_same_iteration() {
        let mut log = RunLog::new("run-x".into(), PathBuf::from("/s.md"));
        log.record_iteration(IterationSummary {
            iteration: 1,
            beads_completed: 1,
            ..Default::default()
        });
        log.record_iteration(IterationSummary {
            iteration: 1,
            beads_completed: 2,
            ..Default::default()
        });
        assert_eq!(log.iterations.len(), 1);
        assert_eq!(log.iterations[0].beads_completed, 2);
    }

    #[tokio::test]
    async fn write_failure_is_swallowed() {
        let writer = RunLogWriter::new("/nonexistent-dir-xyz/run-log.yml");
        let log = RunLog::new("run-x".into(), PathBuf::from("/s.md"));
        writer.write(&log).await; // must not panic
    }
}
