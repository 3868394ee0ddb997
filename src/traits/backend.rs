// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Capability interfaces over coding and judge tools.
//!
//! The orchestrator never shells out to a concrete tool directly; it talks
//! to these two traits, and concrete implementations are injected at
//! construction. The uniform `ProcessResult` → `AgentResult` mapping lives
//! here so every backend interprets exit status the same way.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::HarnessResult;

/// Output mode requested from an agent spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Options for one coding-agent spawn.
#[derive(Debug, Clone)]
pub struct AgentSpawnOpts {
    pub workdir: PathBuf,
    pub prompt: String,
    pub timeout: Duration,
    pub env: HashMap<String, String>,
    pub system_prompt: Option<String>,
    pub output_format: OutputFormat,
}

impl AgentSpawnOpts {
    pub fn new(workdir: PathBuf, prompt: String, timeout: Duration) -> Self {
        Self {
            workdir,
            prompt,
            timeout,
            env: HashMap::new(),
            system_prompt: None,
            output_format: OutputFormat::default(),
        }
    }
}

/// Options for one judge evaluation.
#[derive(Debug, Clone)]
pub struct JudgeOpts {
    pub workdir: PathBuf,
    pub frozen_spec_path: PathBuf,
    pub acceptance_path: Option<PathBuf>,
    pub observation_bead_ids: Vec<String>,
    pub timeout: Duration,
    pub env: HashMap<String, String>,
}

/// Raw outcome of a finished (or killed) child process.
#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub exit_code: i32,
    pub last_lines: String,
    pub duration: Duration,
    pub timed_out: bool,
    pub pid: Option<u32>,
}

/// Interpreted agent outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Success,
    Failure,
    Timeout,
}

/// Result of one agent spawn, as the orchestrator consumes it.
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub status: AgentStatus,
    pub exit_code: i32,
    pub last_lines: String,
    pub duration: Duration,
    pub pid: Option<u32>,
}

impl AgentResult {
    /// A spawn rejection coerced into the same shape as a failed run, so
    /// the orchestrator has a single code path for both.
    pub fn from_spawn_error(message: impl Into<String>, duration: Duration) -> Self {
        Self {
            status: AgentStatus::Failure,
            exit_code: 1,
            last_lines: message.into(),
            duration,
            pid: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == AgentStatus::Success
    }
}

impl From<ProcessResult> for AgentResult {
    /// Timeout wins ties: a process that timed out is `Timeout` regardless
    /// of the exit code the kill produced.
    fn from(result: ProcessResult) -> Self {
        let status = if result.timed_out {
            AgentStatus::Timeout
        } else if result.exit_code == 0 {
            AgentStatus::Success
        } else {
            AgentStatus::Failure
        };
        Self {
            status,
            exit_code: result.exit_code,
            last_lines: result.last_lines,
            duration: result.duration,
            pid: result.pid,
        }
    }
}

/// Whether the implementation drifted from the frozen spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpecDrift {
    pub detected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// One acceptance criterion outcome in a judge verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionOutcome {
    pub name: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Aggregate acceptance verdict.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Acceptance {
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub criteria: Vec<CriterionOutcome>,
}

/// Judge triage decision for one observation bead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationDisposition {
    Promote,
    Dismiss,
    Merge,
}

/// One observation action in a judge verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationAction {
    pub bead_id: String,
    pub action: ObservationDisposition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_into: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// A remediation bead the judge wants created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBead {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

/// Full verdict returned by a judge evaluation and persisted per iteration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgeResult {
    pub spec_drift: SpecDrift,
    pub acceptance: Acceptance,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub observations: Vec<ObservationAction>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub new_beads: Vec<NewBead>,
}

impl JudgeResult {
    /// PASS iff acceptance passed and no drift was detected.
    pub fn passed(&self) -> bool {
        self.acceptance.passed && !self.spec_drift.detected
    }

    /// A synthesized failing verdict for a judge that modified its
    /// read-only worktree.
    pub fn integrity_failure(note: impl Into<String>) -> Self {
        Self {
            spec_drift: SpecDrift { detected: false, notes: None },
            acceptance: Acceptance {
                passed: false,
                summary: Some(format!("judge failure (integrity): {}", note.into())),
                criteria: Vec::new(),
            },
            observations: Vec::new(),
            new_beads: Vec::new(),
        }
    }
}

/// A coding tool the pool can spawn into a worktree.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Run one agent to completion (or timeout). Errors are reserved for
    /// spawn-level rejections; a tool that ran and failed still produces
    /// an `AgentResult`.
    async fn spawn(&self, opts: AgentSpawnOpts) -> HarnessResult<AgentResult>;

    /// Kill every process group this backend currently has in flight.
    /// Invoked on interrupt.
    async fn kill_all_active(&self);
}

/// A judge tool that reads the frozen spec plus the workspace and returns
/// a verdict.
#[async_trait]
pub trait JudgeBackend: Send + Sync {
    async fn evaluate(&self, opts: JudgeOpts) -> HarnessResult<JudgeResult>;

    async fn kill_all_active(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_dominates_exit_code() {
        let result = ProcessResult {
            exit_code: 0,
            last_lines: String::new(),
            duration: Duration::from_secs(1),
            timed_out: true,
            pid: Some(42),
        };
        let agent: AgentResult = result.into();
        assert_eq!(agent.status, AgentStatus::Timeout);
    }

    #[test]
    fn exit_code_maps_to_status() {
        let ok = ProcessResult {
            exit_code: 0,
            last_lines: "done".into(),
            duration: Duration::from_secs(1),
            timed_out: false,
            pid: Some(7),
        };
        assert_eq!(AgentResult::from(ok).status, AgentStatus::Success);

        let bad = ProcessResult {
            exit_code: 3,
            last_lines: "boom".into(),
            duration: Duration::from_secs(1),
            timed_out: false,
            pid: Some(7),
        };
        assert_eq!(AgentResult::from(bad).status, AgentStatus::Failure);
    }

    #[test]
    fn spawn_error_coercion_shape() {
        let coerced = AgentResult::from_spawn_error("no such tool", Duration::ZERO);
        assert_eq!(coerced.status, AgentStatus::Failure);
        assert_eq!(coerced.exit_code, 1);
        assert_eq!(coerced.last_lines, "no such tool");
        assert!(coerced.pid.is_none());
    }

    #[test]
    fn verdict_requires_acceptance_and_no_drift() {
        let mut verdict = JudgeResult::default();
        verdict.acceptance.passed = true;
        assert!(verdict.passed());

        verdict.spec_drift.detected = true;
        assert!(!verdict.passed());
    }

    #[test]
    fn judge_result_yaml_round_trip() {
        let verdict = JudgeResult {
            spec_drift: SpecDrift { detected: false, notes: None },
            acceptance: Acceptance {
                passed: false,
                summary: Some("2 of 3 criteria met".into()),
                criteria: vec![CriterionOutcome {
                    name: "parses valid input".into(),
                    passed: true,
                    details: None,
                }],
            },
            observations: vec![ObservationAction {
                bead_id: "bd-9".into(),
                action: ObservationDisposition::Promote,
                merge_into: None,
                title: Some("harden error path".into()),
            }],
            new_beads: vec![NewBead {
                title: "fix rounding".into(),
                description: None,
                depends_on: vec![],
            }],
        };

        let yaml = serde_yaml::to_string(&verdict).unwrap();
        assert!(yaml.contains("specDrift:"));
        assert!(yaml.contains("newBeads:"));
        assert!(yaml.contains("beadId: bd-9"));
        let back: JudgeResult = serde_yaml::from_str(&yaml).unwrap();
        assert!(!back.passed());
        assert_eq!(back.observations.len(), 1);
        assert_eq!(back.new_beads[0].title, "fix rounding");
    }
}
