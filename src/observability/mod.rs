// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Structured logging message types.
//!
//! Message types follow a struct-based pattern with `Display` so log text
//! lives in one place instead of as magic strings at call sites. Messages
//! are organized by subsystem:
//!
//! * `messages::run` - run lifecycle and phase transitions
//! * `messages::agent` - agent spawn/finish and retry accounting
//! * `messages::judge` - judge verdicts and integrity findings

pub mod messages;

pub use messages::StructuredLog;
