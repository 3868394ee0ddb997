// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Message types for judge verdicts.

use std::fmt::{Display, Formatter};

use crate::observability::messages::StructuredLog;

/// A judge evaluation came back.
///
/// # Log Level
/// `info!`
pub struct JudgeFinished {
    pub iteration: u32,
    pub passed: bool,
    pub new_beads: usize,
    pub observations: usize,
}

impl Display for JudgeFinished {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Judge iteration {}: {} ({} new beads, {} observations)",
            self.iteration,
            if self.passed { "PASS" } else { "FAIL" },
            self.new_beads,
            self.observations
        )
    }
}

impl StructuredLog for JudgeFinished {
    fn log(&self) {
        tracing::info!(
            iteration = self.iteration,
            passed = self.passed,
            new_beads = self.new_beads,
            observations = self.observations,
            "{}",
            self
        );
    }
}

/// The judge modified its read-only worktree.
///
/// # Log Level
/// `warn!`
pub struct JudgeIntegrityViolation<'a> {
    pub iteration: u32,
    pub worktree: &'a str,
}

impl Display for JudgeIntegrityViolation<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Judge iteration {} modified its read-only worktree {}",
            self.iteration, self.worktree
        )
    }
}

impl StructuredLog for JudgeIntegrityViolation<'_> {
    fn log(&self) {
        tracing::warn!(
            iteration = self.iteration,
            worktree = self.worktree,
            "{}",
            self
        );
    }
}
