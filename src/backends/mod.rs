// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

pub mod process;
pub mod stub;

pub use process::{ProcessAgentBackend, ProcessJudgeBackend};
pub use stub::{StubAgentBackend, StubJudgeBackend};

use crate::errors::{HarnessError, HarnessResult};

/// Verify every configured tool resolves on PATH (or is a runnable path).
///
/// Done once at startup so a missing tool fails the run before any state
/// is written, instead of surfacing as a retry storm.
pub fn ensure_tools_available<'a>(tools: impl Iterator<Item = &'a str>) -> HarnessResult<()> {
    for tool in tools {
        if !tool_resolves(tool) {
            return Err(HarnessError::BackendUnavailable(format!(
                "tool '{tool}' not found on PATH"
            )));
        }
    }
    Ok(())
}

fn tool_resolves(tool: &str) -> bool {
    let candidate = std::path::Path::new(tool);
    if candidate.components().count() > 1 {
        return candidate.is_file();
    }
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(tool).is_file())
}
