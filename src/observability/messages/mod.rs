// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Centralized message types for structured logging.
//!
//! Each message type implements `Display` for human-readable output and
//! `StructuredLog` to emit the same message with machine-readable fields.

pub mod agent;
pub mod judge;
pub mod run;

/// Emit this message through `tracing` with structured fields attached.
pub trait StructuredLog {
    fn log(&self);
}
