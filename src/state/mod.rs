// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

pub mod checkpoint;
pub mod events;
pub mod lock;
pub mod run_log;

pub use checkpoint::{
    ActiveAgent, AgentRoster, BeadProgress, Checkpoint, CheckpointManager, MaintenanceRun,
    MaintenanceRunState, MaintenanceState, ObservationState, RunState, SCHEMA_VERSION,
};
pub use events::EventLogger;
pub use lock::{LockRecord, RunLock};
pub use run_log::{IterationSummary, RunLog, RunLogWriter};
