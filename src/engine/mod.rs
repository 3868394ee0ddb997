// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

pub mod agent_pool;
pub mod graph;
pub mod orchestrator;
pub mod scheduler;

pub use agent_pool::AgentPool;
pub use graph::DependencyGraph;
pub use orchestrator::{
    generate_run_id, Collaborators, Orchestrator, PreparedRun, RunOptions, RunOutcome, RunStatus,
};
pub use scheduler::Scheduler;
