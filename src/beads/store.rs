// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Child-process client for the bead store CLI.
//!
//! The store is file-backed and not safe under concurrent writers, so every
//! invocation goes through one internal mutex; tokio's `Mutex` hands the
//! lock out in FIFO order, which linearizes store calls in call order.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::warn;

use crate::beads::{Bead, BeadKind, BeadStatus};
use crate::errors::{HarnessError, HarnessResult};
use crate::traits::BeadStore;

/// Client for the `tbd`-style issue tracker CLI.
pub struct CliBeadStore {
    command: String,
    workdir: PathBuf,
    serial: Mutex<()>,
}

impl CliBeadStore {
    pub fn new(command: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            workdir: workdir.into(),
            serial: Mutex::new(()),
        }
    }

    /// Run one store subcommand to completion and return its stdout.
    async fn run(&self, args: &[String]) -> HarnessResult<String> {
        let _guard = self.serial.lock().await;

        let output = Command::new(&self.command)
            .args(args)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|err| {
                HarnessError::ConfigInvalid(format!(
                    "bead store command '{}' failed to start: {err}",
                    self.command
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HarnessError::ConfigInvalid(format!(
                "bead store '{} {}' exited with {}: {}",
                self.command,
                args.join(" "),
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Parse a `--json` listing, skipping records the model cannot hold.
    ///
    /// One malformed or unknown-status record must not abort a whole
    /// listing; those are logged and dropped.
    fn parse_listing(raw: &str) -> HarnessResult<Vec<Bead>> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        let values: Vec<serde_json::Value> = serde_json::from_str(trimmed).map_err(|err| {
            HarnessError::ConfigInvalid(format!("bead store listing is not a JSON array: {err}"))
        })?;

        let mut beads = Vec::with_capacity(values.len());
        for value in values {
            match serde_json::from_value::<Bead>(value.clone()) {
                Ok(bead) => beads.push(bead),
                Err(err) => {
                    let id = value
                        .get("id")
                        .and_then(|v| v.as_str())
                        .unwrap_or("<no id>");
                    warn!(bead = id, error = %err, "skipping unparseable bead record");
                }
            }
        }
        Ok(beads)
    }
}

#[async_trait]
impl BeadStore for CliBeadStore {
    async fn list(&self, labels: &[String], status: Option<BeadStatus>) -> HarnessResult<Vec<Bead>> {
        let mut args = vec!["list".to_string()];
        for label in labels {
            args.push(format!("--label={label}"));
        }
        if let Some(status) = status {
            args.push(format!("--status={}", status.as_str()));
        }
        args.push("--json".to_string());

        let stdout = self.run(&args).await?;
        Self::parse_listing(&stdout)
    }

    async fn show(&self, id: &str) -> HarnessResult<Bead> {
        let args = vec!["show".to_string(), id.to_string(), "--json".to_string()];
        let stdout = self.run(&args).await?;
        serde_json::from_str(stdout.trim()).map_err(|err| {
            HarnessError::ConfigInvalid(format!("bead store returned unparseable bead '{id}': {err}"))
        })
    }

    async fn create(&self, title: &str, kind: BeadKind, labels: &[String]) -> HarnessResult<String> {
        let mut args = vec![
            "create".to_string(),
            title.to_string(),
            format!("--type={}", kind.as_str()),
        ];
        for label in labels {
            args.push(format!("--label={label}"));
        }

        let stdout = self.run(&args).await?;
        let id = stdout.trim().to_string();
        if id.is_empty() {
            return Err(HarnessError::ConfigInvalid(
                "bead store create returned no id".into(),
            ));
        }
        Ok(id)
    }

    async fn update_status(&self, id: &str, status: BeadStatus) -> HarnessResult<()> {
        let args = vec![
            "update".to_string(),
            id.to_string(),
            format!("--status={}", status.as_str()),
        ];
        self.run(&args).await.map(|_| ())
    }

    async fn close(&self, id: &str, reason: Option<&str>) -> HarnessResult<()> {
        let mut args = vec!["close".to_string(), id.to_string()];
        if let Some(reason) = reason {
            args.push(format!("--reason={reason}"));
        }
        self.run(&args).await.map(|_| ())
    }

    async fn add_label(&self, id: &str, label: &str) -> HarnessResult<()> {
        let args = vec![
            "label".to_string(),
            "add".to_string(),
            id.to_string(),
            label.to_string(),
        ];
        self.run(&args).await.map(|_| ())
    }

    async fn add_dependency(&self, dependent: &str, dependency: &str) -> HarnessResult<()> {
        // Human-readable direction: "dependent depends on dependency"; the
        // store records the inverse blocking edge itself.
        let args = vec![
            "dep".to_string(),
            "add".to_string(),
            dependent.to_string(),
            dependency.to_string(),
        ];
        self.run(&args).await.map(|_| ())
    }

    async fn sync(&self) -> HarnessResult<()> {
        self.run(&["sync".to_string()]).await.map(|_| ())
    }
}
