// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Message types for agent spawns and retry accounting.

use std::fmt::{Display, Formatter};

use crate::observability::messages::StructuredLog;

/// One coding agent started on a bead.
///
/// # Log Level
/// `info!`
pub struct AgentStarted<'a> {
    pub agent_id: u64,
    pub bead_id: &'a str,
    pub attempt: u32,
}

impl Display for AgentStarted<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Agent {} started on bead {} (attempt {})",
            self.agent_id, self.bead_id, self.attempt
        )
    }
}

impl StructuredLog for AgentStarted<'_> {
    fn log(&self) {
        tracing::info!(
            agent_id = self.agent_id,
            bead_id = self.bead_id,
            attempt = self.attempt,
            "{}",
            self
        );
    }
}

/// One coding agent finished, whatever the outcome.
///
/// # Log Level
/// `info!`
pub struct AgentFinished<'a> {
    pub agent_id: u64,
    pub bead_id: &'a str,
    pub status: &'a str,
    pub exit_code: i32,
}

impl Display for AgentFinished<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Agent {} on bead {} finished: {} (exit {})",
            self.agent_id, self.bead_id, self.status, self.exit_code
        )
    }
}

impl StructuredLog for AgentFinished<'_> {
    fn log(&self) {
        tracing::info!(
            agent_id = self.agent_id,
            bead_id = self.bead_id,
            status = self.status,
            exit_code = self.exit_code,
            "{}",
            self
        );
    }
}

/// A bead exhausted its retry budget and was promoted to blocked.
///
/// # Log Level
/// `warn!`
pub struct BeadBlocked<'a> {
    pub bead_id: &'a str,
    pub retries: u32,
}

impl Display for BeadBlocked<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Bead {} blocked after {} attempts",
            self.bead_id, self.retries
        )
    }
}

impl StructuredLog for BeadBlocked<'_> {
    fn log(&self) {
        tracing::warn!(bead_id = self.bead_id, retries = self.retries, "{}", self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_message_names_the_bead() {
        let msg = BeadBlocked { bead_id: "bd-7", retries: 3 };
        assert_eq!(msg.to_string(), "Bead bd-7 blocked after 3 attempts");
    }
}
