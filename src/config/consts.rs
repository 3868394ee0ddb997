// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Built-in defaults and run-directory layout names.

/// Directory (under the repo root) holding per-run state.
pub const DEFAULT_STORAGE_DIR: &str = ".specforge";

/// Default bead-store CLI command.
pub const DEFAULT_STORE_COMMAND: &str = "tbd";

/// Default concurrent agent slots.
pub const DEFAULT_MAX_CONCURRENCY: usize = 2;

/// Default wall-clock budget for one coding-agent spawn.
pub const DEFAULT_BEAD_TIMEOUT_SECS: u64 = 1800;

/// Retries before a bead is promoted to blocked.
pub const DEFAULT_MAX_RETRIES_PER_BEAD: u32 = 2;

/// Judge loop bound.
pub const DEFAULT_MAX_ITERATIONS: u32 = 3;

/// Maintenance cadence when triggering every N completed beads.
pub const DEFAULT_MAINTENANCE_EVERY_N: usize = 5;

/// Budget for the one-shot acceptance-criteria generation spawn.
pub const ACCEPTANCE_TIMEOUT_SECS: u64 = 300;

// Run directory layout.
pub const CHECKPOINT_FILENAME: &str = "checkpoint.yml";
pub const EVENTS_FILENAME: &str = "events.jsonl";
pub const RUN_LOG_FILENAME: &str = "run-log.yml";
pub const LOCK_FILENAME: &str = "lock.json";
pub const FROZEN_SPEC_FILENAME: &str = "frozen-spec.md";
pub const ACCEPTANCE_FILENAME: &str = "acceptance.md";
pub const JUDGE_RESULTS_DIRNAME: &str = "judge-results";
