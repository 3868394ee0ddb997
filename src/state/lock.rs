// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Exclusive per-run lock with a liveness heartbeat.
//!
//! Staleness needs both a time bound and a PID aliveness probe: the time
//! bound alone would evict a temporarily paused process, and the PID probe
//! alone would trust a recycled PID forever. Only a lock that is old *and*
//! unsignalable may be reclaimed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::errors::{HarnessError, HarnessResult};

/// Heartbeats older than this are eligible for the PID probe.
pub const STALE_AFTER: Duration = Duration::from_secs(30);

/// How often the background task refreshes `heartbeatAt`.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// The on-disk lock record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub run_id: String,
    pub pid: u32,
    pub hostname: String,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

/// kill-0 semantics: alive when the signal would be deliverable, including
/// EPERM (the process exists but belongs to someone else).
fn pid_is_signalable(pid: u32) -> bool {
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn record_is_stale(record: &LockRecord, now: DateTime<Utc>) -> bool {
    let age = now
        .signed_duration_since(record.heartbeat_at)
        .to_std()
        .unwrap_or(Duration::ZERO);
    age > STALE_AFTER && !pid_is_signalable(record.pid)
}

async fn write_record(path: &Path, record: &LockRecord) -> HarnessResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let json = serde_json::to_string_pretty(record)?;
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(json.as_bytes()).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Held for the lifetime of one run; releasing deletes the file.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    heartbeat: Option<JoinHandle<()>>,
}

impl RunLock {
    /// Take the lock or fail with `E_RUN_LOCKED`.
    ///
    /// A pre-existing record is honored unless stale; stale records are
    /// removed and replaced. An unparseable record is treated as stale.
    pub async fn acquire(path: impl Into<PathBuf>, run_id: &str) -> HarnessResult<Self> {
        let path = path.into();

        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str::<LockRecord>(&raw) {
                Ok(existing) => {
                    if !record_is_stale(&existing, Utc::now()) {
                        return Err(HarnessError::RunLocked(format!(
                            "run {} holds the lock (pid {} on {}, heartbeat {})",
                            existing.run_id, existing.pid, existing.hostname, existing.heartbeat_at
                        )));
                    }
                    warn!(
                        owner = %existing.run_id,
                        pid = existing.pid,
                        "reclaiming stale run lock"
                    );
                    let _ = tokio::fs::remove_file(&path).await;
                }
                Err(err) => {
                    warn!(error = %err, "removing unparseable run lock");
                    let _ = tokio::fs::remove_file(&path).await;
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let record = LockRecord {
            run_id: run_id.to_string(),
            pid: std::process::id(),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
            started_at: Utc::now(),
            heartbeat_at: Utc::now(),
        };
        write_record(&path, &record).await?;

        let heartbeat = tokio::spawn(heartbeat_loop(path.clone(), record));

        Ok(Self {
            path,
            heartbeat: Some(heartbeat),
        })
    }

    /// Stop the heartbeat and delete the lock file. A missing file is fine.
    pub async fn release(mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        if let Err(err) = tokio::fs::remove_file(&self.path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                debug!(error = %err, "failed to remove lock file");
            }
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}

async fn heartbeat_loop(path: PathBuf, mut record: LockRecord) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // first tick fires immediately
    loop {
        ticker.tick().await;
        record.heartbeat_at = Utc::now();
        if let Err(err) = write_record(&path, &record).await {
            debug!(error = %err, "heartbeat write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn stale_time() -> DateTime<Utc> {
        Utc::now() - TimeDelta::seconds(120)
    }

    #[tokio::test]
    async fn acquire_writes_record_with_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock.json");

        let lock = RunLock::acquire(&path, "run-2025-11-03-aaaaaa").await.unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        let record: LockRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(record.run_id, "run-2025-11-03-aaaaaa");
        assert_eq!(record.pid, std::process::id());

        lock.release().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn live_lock_cannot_be_taken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock.json");

        let first = RunLock::acquire(&path, "run-a").await.unwrap();
        let err = RunLock::acquire(&path, "run-b").await.unwrap_err();
        assert_eq!(err.code(), "E_RUN_LOCKED");
        first.release().await;
    }

    #[tokio::test]
    async fn old_heartbeat_with_live_pid_is_not_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock.json");

        let record = LockRecord {
            run_id: "run-old".into(),
            pid: std::process::id(), // definitely signalable
            hostname: "unknown".into(),
            started_at: stale_time(),
            heartbeat_at: stale_time(),
        };
        std::fs::write(&path, serde_json::to_string(&record).unwrap()).unwrap();

        let err = RunLock::acquire(&path, "run-b").await.unwrap_err();
        assert_eq!(err.code(), "E_RUN_LOCKED");
    }

    #[tokio::test]
    async fn old_heartbeat_with_dead_pid_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock.json");

        let record = LockRecord {
            run_id: "run-dead".into(),
            pid: i32::MAX as u32, // beyond any real pid space
            hostname: "unknown".into(),
            started_at: stale_time(),
            heartbeat_at: stale_time(),
        };
        std::fs::write(&path, serde_json::to_string(&record).unwrap()).unwrap();

        let lock = RunLock::acquire(&path, "run-b").await.unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        let reclaimed: LockRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(reclaimed.run_id, "run-b");
        lock.release().await;
    }

    #[tokio::test]
    async fn fresh_heartbeat_with_dead_pid_is_not_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock.json");

        let record = LockRecord {
            run_id: "run-paused".into(),
            pid: i32::MAX as u32,
            hostname: "unknown".into(),
            started_at: Utc::now(),
            heartbeat_at: Utc::now(),
        };
        std::fs::write(&path, serde_json::to_string(&record).unwrap()).unwrap();

        let err = RunLock::acquire(&path, "run-b").await.unwrap_err();
        assert_eq!(err.code(), "E_RUN_LOCKED");
    }

    #[tokio::test]
    async fn unparseable_lock_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock.json");
        std::fs::write(&path, "not json at all").unwrap();

        let lock = RunLock::acquire(&path, "run-b").await.unwrap();
        lock.release().await;
    }

    #[tokio::test]
    async fn release_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock.json");

        let lock = RunLock::acquire(&path, "run-a").await.unwrap();
        std::fs::remove_file(&path).unwrap();
        lock.release().await; // must not error or panic
    }
}
