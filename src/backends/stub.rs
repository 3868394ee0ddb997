// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! In-process stand-ins for agent and judge tools.
//!
//! Used by the end-to-end tests and by dry runs: no subprocesses, results
//! come from a scripted queue, and an optional hook lets a test mutate the
//! world (close beads, dirty a worktree) the way a real tool would.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::{HarnessError, HarnessResult};
use crate::traits::{
    AgentBackend, AgentResult, AgentSpawnOpts, AgentStatus, JudgeBackend, JudgeOpts, JudgeResult,
};

type SpawnHook = dyn Fn(&AgentSpawnOpts) + Send + Sync;
type EvaluateHook = dyn Fn(&JudgeOpts) + Send + Sync;

/// Agent stub: pops scripted results, defaulting to instant success.
pub struct StubAgentBackend {
    results: Mutex<VecDeque<HarnessResult<AgentResult>>>,
    on_spawn: Option<Box<SpawnHook>>,
}

impl StubAgentBackend {
    pub fn new() -> Self {
        Self {
            results: Mutex::new(VecDeque::new()),
            on_spawn: None,
        }
    }

    /// Queue an explicit result for the next spawn.
    pub fn push_result(&self, result: HarnessResult<AgentResult>) {
        self.results.lock().expect("stub lock").push_back(result);
    }

    /// Observe (and side-effect on) every spawn.
    pub fn with_hook(mut self, hook: impl Fn(&AgentSpawnOpts) + Send + Sync + 'static) -> Self {
        self.on_spawn = Some(Box::new(hook));
        self
    }

    pub fn success_result() -> AgentResult {
        AgentResult {
            status: AgentStatus::Success,
            exit_code: 0,
            last_lines: String::new(),
            duration: Duration::ZERO,
            pid: None,
        }
    }

    pub fn failure_result(message: &str) -> AgentResult {
        AgentResult {
            status: AgentStatus::Failure,
            exit_code: 1,
            last_lines: message.to_string(),
            duration: Duration::ZERO,
            pid: None,
        }
    }
}

impl Default for StubAgentBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentBackend for StubAgentBackend {
    async fn spawn(&self, opts: AgentSpawnOpts) -> HarnessResult<AgentResult> {
        if let Some(hook) = &self.on_spawn {
            hook(&opts);
        }
        let scripted = self.results.lock().expect("stub lock").pop_front();
        match scripted {
            Some(result) => result,
            None => Ok(Self::success_result()),
        }
    }

    async fn kill_all_active(&self) {}
}

/// Judge stub: pops scripted verdicts; an empty queue fails loudly so a
/// test that forgot to script an iteration does not silently pass.
pub struct StubJudgeBackend {
    verdicts: Mutex<VecDeque<HarnessResult<JudgeResult>>>,
    on_evaluate: Option<Box<EvaluateHook>>,
}

impl StubJudgeBackend {
    pub fn new() -> Self {
        Self {
            verdicts: Mutex::new(VecDeque::new()),
            on_evaluate: None,
        }
    }

    pub fn push_verdict(&self, verdict: HarnessResult<JudgeResult>) {
        self.verdicts.lock().expect("stub lock").push_back(verdict);
    }

    pub fn with_hook(mut self, hook: impl Fn(&JudgeOpts) + Send + Sync + 'static) -> Self {
        self.on_evaluate = Some(Box::new(hook));
        self
    }

    /// A verdict that passes outright.
    pub fn passing_verdict() -> JudgeResult {
        let mut verdict = JudgeResult::default();
        verdict.acceptance.passed = true;
        verdict
    }
}

impl Default for StubJudgeBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JudgeBackend for StubJudgeBackend {
    async fn evaluate(&self, opts: JudgeOpts) -> HarnessResult<JudgeResult> {
        if let Some(hook) = &self.on_evaluate {
            hook(&opts);
        }
        self.verdicts
            .lock()
            .expect("stub lock")
            .pop_front()
            .unwrap_or_else(|| {
                Err(HarnessError::JudgeParseFailed(
                    "stub judge has no scripted verdict".into(),
                ))
            })
    }

    async fn kill_all_active(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn unscripted_spawn_defaults_to_success() {
        let stub = StubAgentBackend::new();
        let result = stub
            .spawn(AgentSpawnOpts::new(
                PathBuf::from("/tmp"),
                "p".into(),
                Duration::from_secs(1),
            ))
            .await
            .unwrap();
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn scripted_results_pop_in_order() {
        let stub = StubAgentBackend::new();
        stub.push_result(Ok(StubAgentBackend::failure_result("first")));
        stub.push_result(Ok(StubAgentBackend::success_result()));

        let opts = AgentSpawnOpts::new(PathBuf::from("/tmp"), "p".into(), Duration::from_secs(1));
        let first = stub.spawn(opts.clone()).await.unwrap();
        assert_eq!(first.status, AgentStatus::Failure);
        let second = stub.spawn(opts).await.unwrap();
        assert!(second.is_success());
    }

    #[tokio::test]
    async fn hook_sees_every_spawn() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let stub = StubAgentBackend::new().with_hook(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let opts = AgentSpawnOpts::new(PathBuf::from("/tmp"), "p".into(), Duration::from_secs(1));
        stub.spawn(opts.clone()).await.unwrap();
        stub.spawn(opts).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn judge_without_script_fails_loudly() {
        let stub = StubJudgeBackend::new();
        let err = stub
            .evaluate(JudgeOpts {
                workdir: PathBuf::from("/tmp"),
                frozen_spec_path: PathBuf::from("/tmp/frozen-spec.md"),
                acceptance_path: None,
                observation_bead_ids: vec![],
                timeout: Duration::from_secs(1),
                env: Default::default(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E_JUDGE_PARSE_FAILED");
    }
}
