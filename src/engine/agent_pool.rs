// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Bounded pool of in-flight agent spawns.
//!
//! Each assignment runs as one tokio task racing inside a `JoinSet`;
//! `wait_for_any` surfaces the first completion together with its slot
//! record. A spawn rejection is coerced into a synthesized failure result
//! so the orchestrator has a single code path for "the tool ran and
//! failed" and "the tool never started".

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tracing::warn;

use crate::traits::{AgentBackend, AgentResult, AgentSpawnOpts};

/// Book-keeping for one in-flight agent.
#[derive(Debug, Clone)]
pub struct PoolSlot {
    pub agent_id: u64,
    pub bead_id: String,
    pub worktree: PathBuf,
    pub started_at: DateTime<Utc>,
}

/// One finished agent, slot attached.
#[derive(Debug)]
pub struct PoolCompletion {
    pub slot: PoolSlot,
    pub result: AgentResult,
}

pub struct AgentPool {
    backend: Arc<dyn AgentBackend>,
    max_concurrency: usize,
    next_agent_id: u64,
    tasks: JoinSet<(u64, AgentResult)>,
    slots: HashMap<u64, PoolSlot>,
}

impl AgentPool {
    pub fn new(backend: Arc<dyn AgentBackend>, max_concurrency: usize) -> Self {
        Self {
            backend,
            max_concurrency: max_concurrency.max(1),
            next_agent_id: 0,
            tasks: JoinSet::new(),
            slots: HashMap::new(),
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.slots.len() < self.max_concurrency
    }

    pub fn active_count(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn active_slots(&self) -> impl Iterator<Item = &PoolSlot> {
        self.slots.values()
    }

    /// Start a spawn and record the slot under a fresh monotonic agent id.
    /// Callers gate on `has_capacity` first.
    pub fn assign(&mut self, bead_id: &str, worktree: PathBuf, opts: AgentSpawnOpts) -> u64 {
        self.next_agent_id += 1;
        let agent_id = self.next_agent_id;

        let backend = self.backend.clone();
        let started = Instant::now();
        self.tasks.spawn(async move {
            let result = match backend.spawn(opts).await {
                Ok(result) => result,
                Err(err) => AgentResult::from_spawn_error(err.to_string(), started.elapsed()),
            };
            (agent_id, result)
        });

        self.slots.insert(
            agent_id,
            PoolSlot {
                agent_id,
                bead_id: bead_id.to_string(),
                worktree,
                started_at: Utc::now(),
            },
        );
        agent_id
    }

    /// Wait for the first completion; `None` when the pool is empty.
    pub async fn wait_for_any(&mut self) -> Option<PoolCompletion> {
        loop {
            match self.tasks.join_next().await {
                None => {
                    if !self.slots.is_empty() {
                        warn!(orphaned = self.slots.len(), "clearing orphaned pool slots");
                        self.slots.clear();
                    }
                    return None;
                }
                Some(Ok((agent_id, result))) => {
                    let Some(slot) = self.slots.remove(&agent_id) else {
                        warn!(agent_id, "completion for unknown pool slot");
                        continue;
                    };
                    return Some(PoolCompletion { slot, result });
                }
                Some(Err(join_err)) => {
                    // A panicked spawn task; its slot can never complete.
                    warn!(error = %join_err, "agent task aborted");
                    continue;
                }
            }
        }
    }

    /// Drain every in-flight agent.
    pub async fn wait_for_all(&mut self) -> Vec<PoolCompletion> {
        let mut completions = Vec::new();
        while let Some(completion) = self.wait_for_any().await {
            completions.push(completion);
        }
        completions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{HarnessError, HarnessResult};
    use crate::traits::AgentStatus;
    use async_trait::async_trait;
    use std::path::Path;
    use std::time::Duration;

    struct ScriptedBackend {
        fail_spawn: bool,
        delay: Duration,
        exit_code: i32,
    }

    #[async_trait]
    impl AgentBackend for ScriptedBackend {
        async fn spawn(&self, _opts: AgentSpawnOpts) -> HarnessResult<AgentResult> {
            if self.fail_spawn {
                return Err(HarnessError::BackendUnavailable("tool missing".into()));
            }
            tokio::time::sleep(self.delay).await;
            Ok(AgentResult {
                status: if self.exit_code == 0 {
                    AgentStatus::Success
                } else {
                    AgentStatus::Failure
                },
                exit_code: self.exit_code,
                last_lines: String::new(),
                duration: self.delay,
                pid: None,
            })
        }

        async fn kill_all_active(&self) {}
    }

    fn opts() -> AgentSpawnOpts {
        AgentSpawnOpts::new(Path::new("/tmp").into(), "do it".into(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn wait_for_any_returns_slot_with_result() {
        let backend = Arc::new(ScriptedBackend {
            fail_spawn: false,
            delay: Duration::from_millis(5),
            exit_code: 0,
        });
        let mut pool = AgentPool::new(backend, 2);
        let id = pool.assign("bd-1", "/wt/bd-1".into(), opts());

        let completion = pool.wait_for_any().await.unwrap();
        assert_eq!(completion.slot.agent_id, id);
        assert_eq!(completion.slot.bead_id, "bd-1");
        assert!(completion.result.is_success());
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn empty_pool_returns_none() {
        let backend = Arc::new(ScriptedBackend {
            fail_spawn: false,
            delay: Duration::ZERO,
            exit_code: 0,
        });
        let mut pool = AgentPool::new(backend, 2);
        assert!(pool.wait_for_any().await.is_none());
    }

    #[tokio::test]
    async fn spawn_rejection_is_coerced_to_failure_result() {
        let backend = Arc::new(ScriptedBackend {
            fail_spawn: true,
            delay: Duration::ZERO,
            exit_code: 0,
        });
        let mut pool = AgentPool::new(backend, 1);
        pool.assign("bd-1", "/wt/bd-1".into(), opts());

        let completion = pool.wait_for_any().await.unwrap();
        assert_eq!(completion.result.status, AgentStatus::Failure);
        assert_eq!(completion.result.exit_code, 1);
        assert!(completion.result.last_lines.contains("tool missing"));
    }

    #[tokio::test]
    async fn agent_ids_are_monotonic() {
        let backend = Arc::new(ScriptedBackend {
            fail_spawn: false,
            delay: Duration::ZERO,
            exit_code: 0,
        });
        let mut pool = AgentPool::new(backend, 4);
        let a = pool.assign("bd-1", "/wt/1".into(), opts());
        let b = pool.assign("bd-2", "/wt/2".into(), opts());
        let c = pool.assign("bd-3", "/wt/3".into(), opts());
        assert!(a < b && b < c);
        pool.wait_for_all().await;
    }

    #[tokio::test]
    async fn capacity_tracking() {
        let backend = Arc::new(ScriptedBackend {
            fail_spawn: false,
            delay: Duration::from_millis(20),
            exit_code: 0,
        });
        let mut pool = AgentPool::new(backend, 2);
        assert!(pool.has_capacity());
        pool.assign("bd-1", "/wt/1".into(), opts());
        assert!(pool.has_capacity());
        pool.assign("bd-2", "/wt/2".into(), opts());
        assert!(!pool.has_capacity());
        assert_eq!(pool.active_count(), 2);

        let drained = pool.wait_for_all().await;
        assert_eq!(drained.len(), 2);
        assert!(pool.has_capacity());
    }

    #[tokio::test]
    async fn wait_for_all_drains_mixed_outcomes() {
        let ok = Arc::new(ScriptedBackend {
            fail_spawn: false,
            delay: Duration::from_millis(5),
            exit_code: 0,
        });
        let mut pool = AgentPool::new(ok, 4);
        pool.assign("bd-1", "/wt/1".into(), opts());
        pool.assign("bd-2", "/wt/2".into(), opts());

        let completions = pool.wait_for_all().await;
        assert_eq!(completions.len(), 2);
        assert!(pool.is_empty());
        assert!(pool.wait_for_any().await.is_none());
    }
}
