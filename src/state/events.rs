// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Append-only JSON-lines audit log.
//!
//! Writes are funneled through one channel into a single writer task, so at
//! most one write is ever in flight: concurrent `emit` calls are linearized
//! in call order and every line lands whole. A failed write is swallowed;
//! the audit log must never take the run down with it.

use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::errors::HarnessResult;

pub struct EventLogger {
    tx: Option<mpsc::UnboundedSender<String>>,
    writer: Option<JoinHandle<()>>,
}

impl EventLogger {
    /// Open (or create) the events file in append mode and start the
    /// writer task.
    pub async fn open(path: &Path) -> HarnessResult<Self> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let writer = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Err(err) = file.write_all(line.as_bytes()).await {
                    debug!(error = %err, "event write failed; continuing");
                }
            }
            let _ = file.flush().await;
        });

        Ok(Self {
            tx: Some(tx),
            writer: Some(writer),
        })
    }

    /// Enqueue one event record. Stamps `v: 1` and `ts: now`; any fields in
    /// `fields` pass through untyped.
    pub fn emit(&self, event: &str, fields: Value) {
        let mut record = json!({
            "v": 1,
            "ts": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "event": event,
        });
        if let (Some(target), Value::Object(extra)) = (record.as_object_mut(), fields) {
            for (key, value) in extra {
                target.insert(key, value);
            }
        }

        let mut line = record.to_string();
        line.push('\n');
        if let Some(tx) = &self.tx {
            // A closed channel means we are already shutting down.
            let _ = tx.send(line);
        }
    }

    /// Drain the queue and release the file handle.
    pub async fn close(mut self) {
        self.tx.take();
        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }
    }
}

impl Drop for EventLogger {
    fn drop(&mut self) {
        // Dropping the sender lets the writer task drain and exit on its own.
        self.tx.take();
    }
}
