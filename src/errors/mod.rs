// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Typed harness errors for the run pipeline.
//!
//! Every fatal condition the orchestrator can hit maps to exactly one
//! variant here, each carrying a stable `E_*` code and a conventional CLI
//! exit code. Anything else raised inside the pipeline is wrapped into
//! `ConfigInvalid` at the boundary so the event log is closed and the run
//! lock released on every exit path.

use thiserror::Error;

/// Result alias used throughout the pipeline.
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Fatal, typed errors. Each variant owns one code in the taxonomy.
///
/// Three codes (`E_AGENT_TIMEOUT`, `E_MAX_RUNTIME`, `E_PR_CREATE_FAILED`)
/// are reserved: the variants exist and map to codes, but nothing in the
/// pipeline constructs them. Agent timeouts feed retry accounting instead,
/// and publication failure is a non-fatal event.
#[derive(Error, Debug)]
pub enum HarnessError {
    /// The spec file is missing or unreadable.
    #[error("spec not found: {0}")]
    SpecNotFound(String),

    /// Malformed configuration, or an untyped error wrapped at the
    /// pipeline boundary.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The selected agent or judge tool is not present on this host.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The decompose selector matched nothing, or stray open beads exist
    /// without a selector.
    #[error("bead scope is ambiguous: {0}")]
    BeadScopeAmbiguous(String),

    /// A live lock is held by another run.
    #[error("run is locked: {0}")]
    RunLocked(String),

    /// Unknown schema version, missing run directory, or a terminal run
    /// handed to resume.
    #[error("checkpoint is corrupt: {0}")]
    CheckpointCorrupt(String),

    /// The acceptance artifact vanished between runs.
    #[error("acceptance artifact missing: {0}")]
    AcceptanceMissing(String),

    /// The frozen spec bytes changed after freeze.
    #[error("frozen spec hash mismatch: {0}")]
    SpecHashMismatch(String),

    /// The bead dependency graph contains at least one cycle.
    #[error("dependency graph contains a cycle: {0}")]
    GraphCycle(String),

    /// No ready beads, none running, some still open.
    #[error("scheduling deadlock: {0}")]
    Deadlock(String),

    /// A deadlock explained by unresolved beads outside the run scope.
    #[error("blocked on external beads: {0}")]
    ExternalBlocked(String),

    /// Reserved.
    #[error("agent timed out: {0}")]
    AgentTimeout(String),

    /// Judge output did not parse into the verdict schema.
    #[error("judge output failed to parse: {0}")]
    JudgeParseFailed(String),

    /// Reserved; publication is non-fatal in practice.
    #[error("pull request creation failed: {0}")]
    PrCreateFailed(String),

    /// The judge never reached PASS within the configured iteration bound.
    #[error("judge never passed within {0} iterations")]
    MaxIterations(u32),

    /// Reserved.
    #[error("maximum runtime exceeded: {0}")]
    MaxRuntime(String),
}

impl HarnessError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            HarnessError::SpecNotFound(_) => "E_SPEC_NOT_FOUND",
            HarnessError::ConfigInvalid(_) => "E_CONFIG_INVALID",
            HarnessError::BackendUnavailable(_) => "E_BACKEND_UNAVAILABLE",
            HarnessError::BeadScopeAmbiguous(_) => "E_BEAD_SCOPE_AMBIGUOUS",
            HarnessError::RunLocked(_) => "E_RUN_LOCKED",
            HarnessError::CheckpointCorrupt(_) => "E_CHECKPOINT_CORRUPT",
            HarnessError::AcceptanceMissing(_) => "E_ACCEPTANCE_MISSING",
            HarnessError::SpecHashMismatch(_) => "E_SPEC_HASH_MISMATCH",
            HarnessError::GraphCycle(_) => "E_GRAPH_CYCLE",
            HarnessError::Deadlock(_) => "E_DEADLOCK",
            HarnessError::ExternalBlocked(_) => "E_EXTERNAL_BLOCKED",
            HarnessError::AgentTimeout(_) => "E_AGENT_TIMEOUT",
            HarnessError::JudgeParseFailed(_) => "E_JUDGE_PARSE_FAILED",
            HarnessError::PrCreateFailed(_) => "E_PR_CREATE_FAILED",
            HarnessError::MaxIterations(_) => "E_MAX_ITERATIONS",
            HarnessError::MaxRuntime(_) => "E_MAX_RUNTIME",
        }
    }

    /// Conventional CLI exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            HarnessError::SpecNotFound(_)
            | HarnessError::ConfigInvalid(_)
            | HarnessError::BackendUnavailable(_)
            | HarnessError::BeadScopeAmbiguous(_) => 2,
            HarnessError::RunLocked(_)
            | HarnessError::CheckpointCorrupt(_)
            | HarnessError::AcceptanceMissing(_)
            | HarnessError::SpecHashMismatch(_) => 3,
            HarnessError::GraphCycle(_)
            | HarnessError::Deadlock(_)
            | HarnessError::ExternalBlocked(_)
            | HarnessError::AgentTimeout(_)
            | HarnessError::JudgeParseFailed(_)
            | HarnessError::PrCreateFailed(_) => 4,
            HarnessError::MaxIterations(_) | HarnessError::MaxRuntime(_) => 5,
        }
    }

    /// Wrap an arbitrary error, preserving an already-typed harness error.
    pub fn wrap_untyped(err: anyhow::Error) -> HarnessError {
        match err.downcast::<HarnessError>() {
            Ok(typed) => typed,
            Err(other) => HarnessError::ConfigInvalid(format!("{other:#}")),
        }
    }
}

impl From<std::io::Error> for HarnessError {
    fn from(err: std::io::Error) -> Self {
        HarnessError::ConfigInvalid(err.to_string())
    }
}

impl From<serde_yaml::Error> for HarnessError {
    fn from(err: serde_yaml::Error) -> Self {
        HarnessError::ConfigInvalid(err.to_string())
    }
}

impl From<serde_json::Error> for HarnessError {
    fn from(err: serde_json::Error) -> Self {
        HarnessError::ConfigInvalid(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_exit_codes_line_up() {
        let cases: Vec<(HarnessError, &str, i32)> = vec![
            (HarnessError::SpecNotFound("x".into()), "E_SPEC_NOT_FOUND", 2),
            (HarnessError::ConfigInvalid("x".into()), "E_CONFIG_INVALID", 2),
            (HarnessError::BackendUnavailable("x".into()), "E_BACKEND_UNAVAILABLE", 2),
            (HarnessError::BeadScopeAmbiguous("x".into()), "E_BEAD_SCOPE_AMBIGUOUS", 2),
            (HarnessError::RunLocked("x".into()), "E_RUN_LOCKED", 3),
            (HarnessError::CheckpointCorrupt("x".into()), "E_CHECKPOINT_CORRUPT", 3),
            (HarnessError::AcceptanceMissing("x".into()), "E_ACCEPTANCE_MISSING", 3),
            (HarnessError::SpecHashMismatch("x".into()), "E_SPEC_HASH_MISMATCH", 3),
            (HarnessError::GraphCycle("x".into()), "E_GRAPH_CYCLE", 4),
            (HarnessError::Deadlock("x".into()), "E_DEADLOCK", 4),
            (HarnessError::ExternalBlocked("x".into()), "E_EXTERNAL_BLOCKED", 4),
            (HarnessError::AgentTimeout("x".into()), "E_AGENT_TIMEOUT", 4),
            (HarnessError::JudgeParseFailed("x".into()), "E_JUDGE_PARSE_FAILED", 4),
            (HarnessError::PrCreateFailed("x".into()), "E_PR_CREATE_FAILED", 4),
            (HarnessError::MaxIterations(2), "E_MAX_ITERATIONS", 5),
            (HarnessError::MaxRuntime("x".into()), "E_MAX_RUNTIME", 5),
        ];
        for (err, code, exit) in cases {
            assert_eq!(err.code(), code);
            assert_eq!(err.exit_code(), exit);
        }
    }

    #[test]
    fn wrap_untyped_preserves_typed_errors() {
        let typed = anyhow::Error::new(HarnessError::Deadlock("stalled".into()));
        let wrapped = HarnessError::wrap_untyped(typed);
        assert_eq!(wrapped.code(), "E_DEADLOCK");

        let untyped = anyhow::anyhow!("something else went wrong");
        let wrapped = HarnessError::wrap_untyped(untyped);
        assert_eq!(wrapped.code(), "E_CONFIG_INVALID");
    }
}
