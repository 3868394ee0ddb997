// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Message types for run lifecycle and phase transitions.

use std::fmt::{Display, Formatter};

use crate::observability::messages::StructuredLog;

/// A run began (fresh or resumed).
///
/// # Log Level
/// `info!`
pub struct RunStarted<'a> {
    pub run_id: &'a str,
    pub resumed: bool,
}

impl Display for RunStarted<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        if self.resumed {
            write!(f, "Resuming run {}", self.run_id)
        } else {
            write!(f, "Starting run {}", self.run_id)
        }
    }
}

impl StructuredLog for RunStarted<'_> {
    fn log(&self) {
        tracing::info!(run_id = self.run_id, resumed = self.resumed, "{}", self);
    }
}

/// The state machine moved to a new phase.
///
/// # Log Level
/// `info!`
pub struct PhaseChanged<'a> {
    pub run_id: &'a str,
    pub from: &'a str,
    pub to: &'a str,
}

impl Display for PhaseChanged<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Run {} phase {} -> {}", self.run_id, self.from, self.to)
    }
}

impl StructuredLog for PhaseChanged<'_> {
    fn log(&self) {
        tracing::info!(run_id = self.run_id, from = self.from, to = self.to, "{}", self);
    }
}

/// The run reached a terminal state.
///
/// # Log Level
/// `info!` on completion, `error!` on failure
pub struct RunFinished<'a> {
    pub run_id: &'a str,
    pub status: &'a str,
    pub iterations: u32,
    pub beads_completed: usize,
}

impl Display for RunFinished<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Run {} {}: {} iterations, {} beads completed",
            self.run_id, self.status, self.iterations, self.beads_completed
        )
    }
}

impl StructuredLog for RunFinished<'_> {
    fn log(&self) {
        if self.status == "completed" {
            tracing::info!(
                run_id = self.run_id,
                iterations = self.iterations,
                beads_completed = self.beads_completed,
                "{}",
                self
            );
        } else {
            tracing::error!(
                run_id = self.run_id,
                iterations = self.iterations,
                beads_completed = self.beads_completed,
                "{}",
                self
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_change_reads_naturally() {
        let msg = PhaseChanged {
            run_id: "run-2025-11-03-aaaaaa",
            from: "freezing",
            to: "decomposing",
        };
        assert_eq!(
            msg.to_string(),
            "Run run-2025-11-03-aaaaaa phase freezing -> decomposing"
        );
    }

    #[test]
    fn resumed_run_says_so() {
        let msg = RunStarted { run_id: "run-x", resumed: true };
        assert!(msg.to_string().starts_with("Resuming"));
    }
}
