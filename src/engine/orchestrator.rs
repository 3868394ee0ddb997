// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! The run state machine.
//!
//! Drives one run through freeze -> decompose -> implement ->
//! (maintain <-> implement) -> judge -> (loop) -> publish, persisting a
//! checkpoint after every transition so a crash at any point resumes
//! exactly where it stopped. All collaborators arrive as trait objects;
//! the orchestrator owns every piece of mutable run state itself.
//!
//! Construction is two-step: `prepare` resolves the run identity (fresh id
//! or newest resumable run) so the caller can build run-scoped
//! collaborators, then `bootstrap` takes the lock and opens the event log.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::beads::{
    run_label, Bead, BeadKind, BeadStatus, MAINTENANCE_LABEL, OBSERVATION_LABEL, REMEDIATION_LABEL,
};
use crate::config::consts::{
    ACCEPTANCE_FILENAME, ACCEPTANCE_TIMEOUT_SECS, CHECKPOINT_FILENAME, EVENTS_FILENAME,
    FROZEN_SPEC_FILENAME, JUDGE_RESULTS_DIRNAME, LOCK_FILENAME, RUN_LOG_FILENAME,
};
use crate::config::{Config, MaintenanceTrigger, OnComplete};
use crate::engine::agent_pool::{AgentPool, PoolCompletion};
use crate::engine::scheduler::Scheduler;
use crate::errors::{HarnessError, HarnessResult};
use crate::observability::messages::agent::{AgentFinished, AgentStarted, BeadBlocked};
use crate::observability::messages::judge::{JudgeFinished, JudgeIntegrityViolation};
use crate::observability::messages::run::{PhaseChanged, RunFinished, RunStarted};
use crate::observability::StructuredLog;
use crate::state::checkpoint::{compute_file_hash, verify_spec_hash};
use crate::state::{
    ActiveAgent, Checkpoint, CheckpointManager, EventLogger, IterationSummary, MaintenanceRun,
    MaintenanceRunState, RunLock, RunLog, RunLogWriter, RunState,
};
use crate::traits::backend::{ObservationDisposition, OutputFormat};
use crate::traits::{
    AgentBackend, AgentSpawnOpts, AgentStatus, BeadStore, JudgeBackend, JudgeOpts, JudgeResult,
    WorktreeManager,
};
use crate::workspace::Publisher;

/// Per-invocation switches that are not part of the durable config.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub resume: bool,
    pub dry_run: bool,
}

/// How a run ended from the caller's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    DryRun,
    Interrupted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::DryRun => "dry-run",
            RunStatus::Interrupted => "interrupted",
        }
    }
}

/// Summary handed back to the binary for user-visible reporting.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub iterations: u32,
    pub beads_total: usize,
    pub beads_completed: usize,
    pub agents_spawned: u64,
    pub schedule_preview: Option<Vec<String>>,
}

/// Injected collaborators (dynamic dispatch replaces subclassing).
pub struct Collaborators {
    pub store: Arc<dyn BeadStore>,
    pub agent_backend: Arc<dyn AgentBackend>,
    pub judge_backend: Arc<dyn JudgeBackend>,
    pub worktrees: Arc<dyn WorktreeManager>,
    pub publisher: Option<Arc<dyn Publisher>>,
}

/// Run identity resolved before collaborators exist.
#[derive(Debug)]
pub struct PreparedRun {
    pub run_dir: PathBuf,
    pub checkpoint: Checkpoint,
    pub resumed: bool,
}

impl PreparedRun {
    pub fn run_id(&self) -> &str {
        &self.checkpoint.run_id
    }

    pub fn target_branch(&self) -> &str {
        &self.checkpoint.target_branch
    }

    pub fn base_branch(&self) -> &str {
        &self.checkpoint.base_branch
    }

    pub fn worktrees_root(&self) -> PathBuf {
        self.run_dir.join("worktrees")
    }
}

/// Generate a fresh `run-YYYY-MM-DD-<6 base36>` identifier.
pub fn generate_run_id() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("run-{}-{}", Utc::now().format("%Y-%m-%d"), suffix)
}

/// One in-flight maintenance spawn; at most one exists at a time.
struct MaintenanceFlight {
    run_index: u32,
    bead_id: String,
    worktree: PathBuf,
    handle: JoinHandle<HarnessResult<crate::traits::AgentResult>>,
}

pub struct Orchestrator {
    config: Config,
    deps: Collaborators,
    cancel: CancellationToken,

    repo_root: PathBuf,
    run_dir: PathBuf,
    checkpoint: Checkpoint,
    checkpoints: CheckpointManager,
    lock: Option<RunLock>,
    events: Option<EventLogger>,
    run_log: RunLog,
    run_log_writer: RunLogWriter,
    scheduler: Option<Scheduler>,
    maintenance_flight: Option<MaintenanceFlight>,

    agents_spawned_total: u64,
    agents_spawned_iteration: u64,
    agent_failures_iteration: usize,
    last_judge_summary: Option<String>,
    schedule_preview: Option<Vec<String>>,
    resumed: bool,
}

impl Orchestrator {
    /// Resolve the run identity: the newest resumable run, or a fresh run
    /// directory with a seeded checkpoint.
    pub async fn prepare(config: &Config, options: RunOptions) -> HarnessResult<PreparedRun> {
        let repo_root = config
            .repo_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        let storage_root = repo_root.join(&config.storage_dir);

        if options.resume {
            let run_dir = newest_run_dir(&storage_root).await?;
            let manager = CheckpointManager::new(run_dir.join(CHECKPOINT_FILENAME));
            let checkpoint = manager.load().await?;
            if checkpoint.state.is_terminal() {
                return Err(HarnessError::CheckpointCorrupt(format!(
                    "run {} is already {}",
                    checkpoint.run_id,
                    checkpoint.state.as_str()
                )));
            }
            return Ok(PreparedRun {
                run_dir,
                checkpoint,
                resumed: true,
            });
        }

        if !config.spec_path.is_file() {
            return Err(HarnessError::SpecNotFound(
                config.spec_path.display().to_string(),
            ));
        }
        let run_id = generate_run_id();
        let run_dir = storage_root.join(&run_id);
        tokio::fs::create_dir_all(&run_dir).await?;

        let mut checkpoint = Checkpoint::new(
            run_id.clone(),
            config.spec_path.clone(),
            config.agents.max_concurrency,
        );
        checkpoint.target_branch = config
            .publish
            .target_branch
            .clone()
            .unwrap_or_else(|| format!("compiler/{run_id}"));
        checkpoint.base_branch = config.publish.base_branch.clone();

        Ok(PreparedRun {
            run_dir,
            checkpoint,
            resumed: false,
        })
    }

    /// Take the run lock, open the event log, and reconcile a resumed
    /// checkpoint's stale claims.
    pub async fn bootstrap(
        config: Config,
        deps: Collaborators,
        prepared: PreparedRun,
    ) -> HarnessResult<Self> {
        let PreparedRun {
            run_dir,
            checkpoint,
            resumed,
        } = prepared;
        let repo_root = config
            .repo_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));

        let lock = RunLock::acquire(run_dir.join(LOCK_FILENAME), &checkpoint.run_id).await?;
        let events = EventLogger::open(&run_dir.join(EVENTS_FILENAME)).await?;

        RunStarted {
            run_id: &checkpoint.run_id,
            resumed,
        }
        .log();
        if resumed {
            events.emit(
                "run_resumed",
                json!({ "runId": checkpoint.run_id, "state": checkpoint.state.as_str() }),
            );
        } else {
            events.emit(
                "run_started",
                json!({
                    "runId": checkpoint.run_id,
                    "specPath": checkpoint.spec_path.display().to_string(),
                }),
            );
        }

        let run_log = RunLog::new(checkpoint.run_id.clone(), checkpoint.spec_path.clone());
        let run_log_writer = RunLogWriter::new(run_dir.join(RUN_LOG_FILENAME));
        let checkpoints = CheckpointManager::new(run_dir.join(CHECKPOINT_FILENAME));

        let mut orchestrator = Self {
            config,
            deps,
            cancel: CancellationToken::new(),
            repo_root,
            run_dir,
            checkpoint,
            checkpoints,
            lock: Some(lock),
            events: Some(events),
            run_log,
            run_log_writer,
            scheduler: None,
            maintenance_flight: None,
            agents_spawned_total: 0,
            agents_spawned_iteration: 0,
            agent_failures_iteration: 0,
            last_judge_summary: None,
            schedule_preview: None,
            resumed,
        };

        if resumed {
            orchestrator.reconcile_after_resume().await?;
        }
        Ok(orchestrator)
    }

    /// Token the binary cancels on SIGINT/SIGTERM.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn run_id(&self) -> &str {
        &self.checkpoint.run_id
    }

    /// Drive the state machine to a terminal state.
    ///
    /// Every error leaving this function is a typed harness error; the
    /// event log is closed and the lock released on all paths.
    pub async fn run(mut self, options: RunOptions) -> HarnessResult<RunOutcome> {
        let result = self.pipeline(options).await;

        let outcome = match result {
            Ok(status) => {
                match status {
                    RunStatus::Completed => {
                        self.emit(
                            "run_completed",
                            json!({
                                "runId": self.checkpoint.run_id,
                                "iterations": self.checkpoint.iteration,
                            }),
                        );
                        self.run_log.finish("completed");
                    }
                    RunStatus::Interrupted => self.run_log.finish("interrupted"),
                    RunStatus::DryRun => self.run_log.finish("dry-run"),
                }
                self.run_log_writer.write(&self.run_log).await;
                RunFinished {
                    run_id: &self.checkpoint.run_id,
                    status: status.as_str(),
                    iterations: self.checkpoint.iteration,
                    beads_completed: self.checkpoint.beads.completed.len(),
                }
                .log();
                Ok(RunOutcome {
                    run_id: self.checkpoint.run_id.clone(),
                    status,
                    iterations: self.checkpoint.iteration,
                    beads_total: self.checkpoint.beads.total,
                    beads_completed: self.checkpoint.beads.completed.len(),
                    agents_spawned: self.agents_spawned_total,
                    schedule_preview: self.schedule_preview.take(),
                })
            }
            Err(err) => {
                self.checkpoint.state = RunState::Failed;
                if let Err(save_err) = self.checkpoints.save(&self.checkpoint).await {
                    warn!(error = %save_err, "failed to persist failed state");
                }
                self.emit(
                    "run_failed",
                    json!({
                        "runId": self.checkpoint.run_id,
                        "code": err.code(),
                        "message": err.to_string(),
                    }),
                );
                self.run_log.finish("failed");
                self.run_log_writer.write(&self.run_log).await;
                RunFinished {
                    run_id: &self.checkpoint.run_id,
                    status: "failed",
                    iterations: self.checkpoint.iteration,
                    beads_completed: self.checkpoint.beads.completed.len(),
                }
                .log();
                Err(err)
            }
        };

        if let Some(events) = self.events.take() {
            events.close().await;
        }
        if let Some(lock) = self.lock.take() {
            lock.release().await;
        }
        outcome
    }

    async fn pipeline(&mut self, options: RunOptions) -> HarnessResult<RunStatus> {
        // A resumed `judging` checkpoint goes straight to the judge; a
        // resumed `maintaining` one re-enters implement (its maintenance
        // flight died with the previous process).
        if self.resumed && self.checkpoint.state == RunState::Maintaining {
            self.checkpoint.state = RunState::Implementing;
        }

        loop {
            if self.cancel.is_cancelled() {
                return self.interrupt().await;
            }
            if self.checkpoint.state != RunState::Freezing {
                self.verify_frozen_spec().await?;
            }
            match self.checkpoint.state {
                RunState::Freezing => {
                    self.freeze().await?;
                    self.transition(RunState::Decomposing).await?;
                }
                RunState::Decomposing => {
                    self.decompose().await?;
                    if options.dry_run {
                        self.schedule_preview = Some(self.build_schedule_preview().await?);
                        return Ok(RunStatus::DryRun);
                    }
                    self.transition(RunState::Implementing).await?;
                }
                RunState::Implementing | RunState::Maintaining => {
                    match self.implement_phase().await? {
                        Some(status) => return Ok(status),
                        None => {
                            if self.config.judge.enabled {
                                self.transition(RunState::Judging).await?;
                            } else {
                                self.transition(RunState::Completed).await?;
                                return Ok(RunStatus::Completed);
                            }
                        }
                    }
                }
                RunState::Judging => {
                    if let Some(status) = self.judge_phase().await? {
                        return Ok(status);
                    }
                }
                RunState::Completed | RunState::Failed => {
                    return Ok(RunStatus::Completed);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Phase: freeze
    // ------------------------------------------------------------------

    async fn freeze(&mut self) -> HarnessResult<()> {
        let spec_path = self.checkpoint.spec_path.clone();
        let frozen_path = self.run_dir.join(FROZEN_SPEC_FILENAME);

        if !frozen_path.is_file() {
            tokio::fs::copy(&spec_path, &frozen_path)
                .await
                .map_err(|err| {
                    HarnessError::SpecNotFound(format!("{}: {err}", spec_path.display()))
                })?;
        }
        let sha256 = compute_file_hash(&frozen_path).await?;
        self.checkpoint.frozen_spec_path = frozen_path.clone();
        self.checkpoint.frozen_spec_sha256 = sha256.clone();

        self.deps.worktrees.create_integration_branch().await?;

        if self.config.acceptance.generate {
            self.generate_acceptance_criteria().await;
        }

        self.emit(
            "spec_frozen",
            json!({
                "path": frozen_path.display().to_string(),
                "sha256": sha256,
            }),
        );
        self.checkpoints.save(&self.checkpoint).await
    }

    /// Best-effort: a failed generation leaves the run without acceptance
    /// criteria rather than failing it.
    async fn generate_acceptance_criteria(&mut self) {
        let acceptance_path = self.run_dir.join(ACCEPTANCE_FILENAME);
        let prompt = format!(
            "Read the frozen specification at {} and write a machine-parseable list of \
             acceptance criteria to {}. Output text only.",
            self.checkpoint.frozen_spec_path.display(),
            acceptance_path.display()
        );
        let mut opts = AgentSpawnOpts::new(
            self.repo_root.clone(),
            prompt,
            Duration::from_secs(ACCEPTANCE_TIMEOUT_SECS),
        );
        opts.output_format = OutputFormat::Text;
        opts.env.insert(
            "SPECFORGE_ACCEPTANCE_PATH".into(),
            acceptance_path.display().to_string(),
        );

        match self.deps.agent_backend.spawn(opts).await {
            Ok(result) if result.is_success() && acceptance_path.is_file() => {
                self.checkpoint.acceptance_path = Some(acceptance_path);
            }
            Ok(result) => {
                warn!(status = ?result.status, "acceptance generation did not produce an artifact");
            }
            Err(err) => {
                warn!(error = %err, "acceptance generation spawn failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Phase: decompose
    // ------------------------------------------------------------------

    async fn decompose(&mut self) -> HarnessResult<()> {
        let label = run_label(&self.checkpoint.run_id);

        if let Some(selector) = self.config.decompose.existing_selector.clone() {
            let selected = self
                .deps
                .store
                .list(&[selector.clone()], Some(BeadStatus::Open))
                .await?;
            if selected.is_empty() {
                return Err(HarnessError::BeadScopeAmbiguous(format!(
                    "selector '{selector}' matched no open beads"
                )));
            }
            // Make the run scope durable before anything else happens.
            for bead in &selected {
                self.deps.store.add_label(&bead.id, &label).await?;
            }
        } else {
            // Auto mode owns the whole open scope; pre-existing open beads
            // would silently leak into the run.
            let stray = self.deps.store.list(&[], Some(BeadStatus::Open)).await?;
            let stray: Vec<&Bead> = stray
                .iter()
                .filter(|b| !b.has_label(&label))
                .collect();
            if !stray.is_empty() {
                return Err(HarnessError::BeadScopeAmbiguous(format!(
                    "{} stray open beads exist without a selector (first: {})",
                    stray.len(),
                    stray[0].id
                )));
            }

            let prompt = format!(
                "Decompose the frozen specification at {} into beads. Create each bead in the \
                 tracker with the label {} and record blocking dependencies between them.",
                self.checkpoint.frozen_spec_path.display(),
                label
            );
            let opts = AgentSpawnOpts::new(
                self.repo_root.clone(),
                prompt,
                Duration::from_secs(self.config.agents.bead_timeout_seconds),
            );
            let result = self.deps.agent_backend.spawn(opts).await?;
            if !result.is_success() {
                return Err(HarnessError::Deadlock(format!(
                    "decomposition agent failed: {}",
                    result.last_lines
                )));
            }
        }

        let run_beads = self.list_run_beads().await?;
        if run_beads.is_empty() {
            return Err(HarnessError::BeadScopeAmbiguous(format!(
                "no beads carry the run label {label}"
            )));
        }

        self.checkpoint.beads.total = run_beads.len();
        self.scheduler = Some(Scheduler::new(run_beads.iter().map(|b| b.id.clone())));

        // Push the labeled scope out through the store's own sync; losing
        // the sync is survivable, losing the labels is not.
        if let Err(err) = self.deps.store.sync().await {
            self.emit(
                "tbd_command_error",
                json!({ "operation": "sync", "error": err.to_string() }),
            );
        }

        self.emit("beads_created", json!({ "count": run_beads.len() }));
        self.checkpoints.save(&self.checkpoint).await
    }

    /// Beads scoped to this run: everything carrying the run label except
    /// the maintenance and observation side channels. Remediation beads
    /// are ordinary run beads.
    async fn list_run_beads(&self) -> HarnessResult<Vec<Bead>> {
        let label = run_label(&self.checkpoint.run_id);
        let beads = self.deps.store.list(&[label], None).await?;
        Ok(beads
            .into_iter()
            .filter(|b| !b.has_label(OBSERVATION_LABEL) && !b.has_label(MAINTENANCE_LABEL))
            .collect())
    }

    /// Simulated full traversal for dry runs: repeatedly pick the next
    /// ready bead, treating each pick as completed.
    async fn build_schedule_preview(&mut self) -> HarnessResult<Vec<String>> {
        let snapshot = self.deps.store.list(&[], None).await?;
        let scheduler = self.scheduler.as_mut().expect("scheduler after decompose");
        scheduler.rebuild(&snapshot);
        scheduler.check_cycles()?;

        let mut completed: Vec<String> = Vec::new();
        let mut preview = Vec::new();
        while let Some(bead) = scheduler.pick_next(&completed, &[], &[]) {
            preview.push(bead.id.clone());
            completed.push(bead.id);
        }
        Ok(preview)
    }

    // ------------------------------------------------------------------
    // Phase: implement
    // ------------------------------------------------------------------

    /// Run the implement loop to quiescence. Returns `Some(status)` when
    /// the run ended early (interrupt), `None` when the phase finished.
    async fn implement_phase(&mut self) -> HarnessResult<Option<RunStatus>> {
        if self.checkpoint.state != RunState::Implementing {
            self.transition(RunState::Implementing).await?;
        }
        self.ensure_scheduler().await?;
        self.agents_spawned_iteration = 0;
        self.agent_failures_iteration = 0;

        let mut pool = AgentPool::new(
            self.deps.agent_backend.clone(),
            self.checkpoint.agents.max_concurrency,
        );
        let cancel = self.cancel.clone();

        loop {
            // Fill every free slot with the next ready bead. Each pick
            // observes a fresh store snapshot so externally-resolved
            // blockers count immediately.
            while pool.has_capacity() {
                let snapshot = self.deps.store.list(&[], None).await?;
                let scheduler = self.scheduler.as_mut().expect("scheduler initialized");
                scheduler.rebuild(&snapshot);
                scheduler.check_cycles()?;
                let next = scheduler.pick_next(
                    &self.checkpoint.beads.completed,
                    &self.checkpoint.beads.in_progress,
                    &self.checkpoint.beads.blocked,
                );
                let Some(bead) = next else { break };
                self.start_agent(&mut pool, bead).await?;
            }

            if pool.is_empty() {
                // Nothing running and nothing pickable: finished or stuck.
                let snapshot = self.deps.store.list(&[], None).await?;
                let scheduler = self.scheduler.as_mut().expect("scheduler initialized");
                scheduler.rebuild(&snapshot);
                if scheduler.detect_deadlock(
                    &self.checkpoint.beads.completed,
                    &self.checkpoint.beads.in_progress,
                    &self.checkpoint.beads.blocked,
                    0,
                ) {
                    let externals = scheduler.detect_external_blockers(
                        &self.checkpoint.beads.completed,
                        &self.checkpoint.beads.blocked,
                    );
                    if !externals.is_empty() {
                        return Err(HarnessError::ExternalBlocked(externals.join("; ")));
                    }
                    return Err(HarnessError::Deadlock(
                        "open beads remain but none are ready and no agents are running".into(),
                    ));
                }
                break;
            }

            let completion = tokio::select! {
                _ = cancel.cancelled() => {
                    return Ok(Some(self.interrupt().await?));
                }
                completion = pool.wait_for_any() => completion,
            };
            if let Some(completion) = completion {
                self.apply_agent_result(completion).await?;
            }
        }

        self.drain_maintenance().await?;
        if self.config.maintenance.trigger == MaintenanceTrigger::AfterAll {
            self.transition(RunState::Maintaining).await?;
            self.start_maintenance().await?;
            self.drain_maintenance().await?;
            self.transition(RunState::Implementing).await?;
        }

        self.record_iteration_summary().await;
        Ok(None)
    }

    async fn start_agent(&mut self, pool: &mut AgentPool, bead: Bead) -> HarnessResult<()> {
        let bead_id = bead.id.clone();
        self.deps
            .store
            .update_status(&bead_id, BeadStatus::InProgress)
            .await?;
        self.checkpoint.beads.mark_in_progress(&bead_id);

        let attempt = self
            .checkpoint
            .beads
            .retry_counts
            .get(&bead_id)
            .copied()
            .unwrap_or(0)
            + 1;
        let claim = format!(
            "{}:{}:{}",
            self.checkpoint.run_id, self.checkpoint.iteration, attempt
        );
        self.checkpoint.beads.claims.insert(bead_id.clone(), claim);

        // Reused on retry so the previous attempt's progress survives.
        let worktree = self.deps.worktrees.create_agent_worktree(&bead_id).await?;

        let dependency_lines = self.resolved_dependency_lines(&bead).await;
        let prompt = build_coding_prompt(&bead, &dependency_lines, &self.checkpoint.target_branch);
        let mut opts = AgentSpawnOpts::new(
            worktree.clone(),
            prompt,
            Duration::from_secs(self.config.agents.bead_timeout_seconds),
        );
        opts.env.insert("SPECFORGE_BEAD_ID".into(), bead_id.clone());
        opts.env
            .insert("SPECFORGE_RUN_ID".into(), self.checkpoint.run_id.clone());

        let agent_id = pool.assign(&bead_id, worktree.clone(), opts);
        self.checkpoint.agents.active.push(ActiveAgent {
            agent_id,
            bead_id: bead_id.clone(),
            worktree: worktree.clone(),
            started_at: Utc::now(),
            pid: None,
        });
        self.agents_spawned_total += 1;
        self.agents_spawned_iteration += 1;

        AgentStarted {
            agent_id,
            bead_id: &bead_id,
            attempt,
        }
        .log();
        self.emit(
            "agent_started",
            json!({
                "agentId": agent_id,
                "beadId": bead_id,
                "attempt": attempt,
                "worktree": worktree.display().to_string(),
            }),
        );
        self.checkpoints.save(&self.checkpoint).await
    }

    async fn apply_agent_result(&mut self, completion: PoolCompletion) -> HarnessResult<()> {
        let PoolCompletion { slot, result } = completion;
        self.checkpoint
            .agents
            .active
            .retain(|a| a.agent_id != slot.agent_id);

        let status_str = match result.status {
            AgentStatus::Success => "success",
            AgentStatus::Failure => "failure",
            AgentStatus::Timeout => "timeout",
        };
        AgentFinished {
            agent_id: slot.agent_id,
            bead_id: &slot.bead_id,
            status: status_str,
            exit_code: result.exit_code,
        }
        .log();
        self.emit(
            "agent_finished",
            json!({
                "agentId": slot.agent_id,
                "beadId": slot.bead_id,
                "status": status_str,
                "exitCode": result.exit_code,
                "durationMs": result.duration.as_millis() as u64,
            }),
        );

        // The agent's word is not enough: the store is the authority on
        // whether the bead actually closed.
        let stored = self.deps.store.show(&slot.bead_id).await?;
        let mut terminal = false;

        if stored.status == BeadStatus::Closed {
            self.checkpoint.beads.mark_completed(&slot.bead_id);
            terminal = true;
            self.emit("bead_completed", json!({ "beadId": slot.bead_id }));
            self.maybe_trigger_maintenance().await?;
        } else {
            if !result.is_success() {
                self.agent_failures_iteration += 1;
            }
            let retries = self.checkpoint.beads.increment_retry(&slot.bead_id);
            if retries > self.config.agents.max_retries_per_bead {
                self.deps
                    .store
                    .update_status(&slot.bead_id, BeadStatus::Blocked)
                    .await?;
                self.checkpoint.beads.mark_blocked(&slot.bead_id);
                terminal = true;
                BeadBlocked {
                    bead_id: &slot.bead_id,
                    retries,
                }
                .log();
                self.emit(
                    "bead_blocked",
                    json!({ "beadId": slot.bead_id, "retries": retries }),
                );
            } else {
                self.deps
                    .store
                    .update_status(&slot.bead_id, BeadStatus::Open)
                    .await?;
                self.checkpoint.beads.mark_open(&slot.bead_id);
                self.emit(
                    "bead_retry",
                    json!({ "beadId": slot.bead_id, "retryCount": retries }),
                );
            }
        }

        if terminal && self.config.worktrees.cleanup {
            if let Err(err) = self.deps.worktrees.remove_worktree(&slot.worktree).await {
                warn!(error = %err, worktree = %slot.worktree.display(), "worktree cleanup failed");
            }
        }

        self.checkpoints.save(&self.checkpoint).await
    }

    /// Lines describing this bead's already-resolved predecessors, for the
    /// coding prompt.
    async fn resolved_dependency_lines(&self, bead: &Bead) -> Vec<String> {
        let mut lines = Vec::new();
        for completed_id in &self.checkpoint.beads.completed {
            if let Ok(done) = self.deps.store.show(completed_id).await {
                if done.blocks_targets().any(|t| t == bead.id) {
                    lines.push(format!("{} (completed): {}", done.id, done.title));
                }
            }
        }
        lines
    }

    // ------------------------------------------------------------------
    // Phase: maintenance
    // ------------------------------------------------------------------

    async fn maybe_trigger_maintenance(&mut self) -> HarnessResult<()> {
        if self.config.maintenance.trigger != MaintenanceTrigger::EveryNBeads {
            return Ok(());
        }
        let completed = self.checkpoint.beads.completed.len();
        if completed == 0 || completed % self.config.maintenance.every_n != 0 {
            return Ok(());
        }
        if self.maintenance_flight.is_some() {
            debug!("maintenance already in flight; skipping trigger");
            return Ok(());
        }
        self.start_maintenance().await
    }

    async fn start_maintenance(&mut self) -> HarnessResult<()> {
        if self.maintenance_flight.is_some() {
            return Ok(());
        }
        let run_index = self.checkpoint.maintenance.run_count + 1;
        let label = run_label(&self.checkpoint.run_id);
        let title = format!("Maintenance run {run_index}");

        let bead_id = match self
            .deps
            .store
            .create(&title, BeadKind::Task, &[label, MAINTENANCE_LABEL.to_string()])
            .await
        {
            Ok(id) => id,
            Err(err) => {
                // Maintenance is never load-bearing.
                self.emit(
                    "tbd_command_error",
                    json!({ "operation": "create", "error": err.to_string() }),
                );
                return Ok(());
            }
        };

        let worktree = self
            .deps
            .worktrees
            .create_maintenance_worktree(run_index)
            .await?;
        let prompt = format!(
            "Perform behaviour-preserving maintenance on this workspace: tidy code, fix \
             warnings, improve structure. Do not change observable behaviour. When finished, \
             close bead {bead_id}."
        );
        let mut opts = AgentSpawnOpts::new(
            worktree.clone(),
            prompt,
            Duration::from_secs(self.config.agents.bead_timeout_seconds),
        );
        opts.env.insert("SPECFORGE_BEAD_ID".into(), bead_id.clone());

        let backend = self.deps.agent_backend.clone();
        let handle = tokio::spawn(async move { backend.spawn(opts).await });

        self.checkpoint.maintenance.run_count = run_index;
        self.checkpoint.maintenance.runs.push(MaintenanceRun {
            id: run_index,
            trigger_completed_count: self.checkpoint.beads.completed.len(),
            state: MaintenanceRunState::Running,
        });
        self.checkpoint.maintenance.bead_id = Some(bead_id.clone());
        self.maintenance_flight = Some(MaintenanceFlight {
            run_index,
            bead_id: bead_id.clone(),
            worktree,
            handle,
        });

        self.emit(
            "maintenance_started",
            json!({ "maintenanceId": run_index, "beadId": bead_id }),
        );
        self.checkpoints.save(&self.checkpoint).await
    }

    async fn drain_maintenance(&mut self) -> HarnessResult<()> {
        let Some(flight) = self.maintenance_flight.take() else {
            return Ok(());
        };

        let state = match flight.handle.await {
            Ok(Ok(result)) if result.is_success() => MaintenanceRunState::Success,
            Ok(Ok(_)) | Ok(Err(_)) => MaintenanceRunState::Failure,
            Err(join_err) => {
                warn!(error = %join_err, "maintenance task aborted");
                MaintenanceRunState::Failure
            }
        };

        if let Some(run) = self
            .checkpoint
            .maintenance
            .runs
            .iter_mut()
            .find(|r| r.id == flight.run_index)
        {
            run.state = state;
        }
        self.checkpoint.maintenance.last_run_at = Some(Utc::now());
        self.checkpoint.maintenance.bead_id = None;

        // Close the tracking bead; a failed run keeps it open for triage.
        if state == MaintenanceRunState::Success {
            if let Err(err) = self
                .deps
                .store
                .close(&flight.bead_id, Some("maintenance run finished"))
                .await
            {
                self.emit(
                    "tbd_command_error",
                    json!({ "operation": "close", "error": err.to_string() }),
                );
            }
        }
        if self.config.worktrees.cleanup {
            if let Err(err) = self.deps.worktrees.remove_worktree(&flight.worktree).await {
                warn!(error = %err, "maintenance worktree cleanup failed");
            }
        }

        self.emit(
            "maintenance_finished",
            json!({
                "maintenanceId": flight.run_index,
                "state": match state {
                    MaintenanceRunState::Success => "success",
                    MaintenanceRunState::Failure => "failure",
                    MaintenanceRunState::Running => "running",
                },
            }),
        );
        self.checkpoints.save(&self.checkpoint).await
    }

    // ------------------------------------------------------------------
    // Phase: judge
    // ------------------------------------------------------------------

    /// Returns `Some(status)` when the run reached a terminal status,
    /// `None` to loop back to implement.
    async fn judge_phase(&mut self) -> HarnessResult<Option<RunStatus>> {
        self.ensure_scheduler().await?;
        let iteration = self.checkpoint.iteration;

        let observations = self
            .deps
            .store
            .list(
                &[
                    OBSERVATION_LABEL.to_string(),
                    run_label(&self.checkpoint.run_id),
                ],
                Some(BeadStatus::Open),
            )
            .await?;
        let observation_ids: Vec<String> = observations.iter().map(|b| b.id.clone()).collect();
        self.checkpoint.observations.pending = observation_ids.clone();

        let worktree = self.deps.worktrees.create_judge_worktree(iteration).await?;
        let timeout = Duration::from_secs(self.config.agents.bead_timeout_seconds * 2);

        let judge_backend = self.deps.judge_backend.clone();
        let opts = JudgeOpts {
            workdir: worktree.clone(),
            frozen_spec_path: self.checkpoint.frozen_spec_path.clone(),
            acceptance_path: self.checkpoint.acceptance_path.clone(),
            observation_bead_ids: observation_ids,
            timeout,
            env: HashMap::new(),
        };
        let cancel = self.cancel.clone();
        let verdict = tokio::select! {
            _ = cancel.cancelled() => {
                return Ok(Some(self.interrupt().await?));
            }
            verdict = judge_backend.evaluate(opts) => verdict?,
        };

        // Integrity: the judge only reads. Any modification voids the
        // verdict wholesale.
        let verdict = if self.deps.worktrees.worktree_is_clean(&worktree).await? {
            verdict
        } else {
            let worktree_str = worktree.display().to_string();
            JudgeIntegrityViolation {
                iteration,
                worktree: &worktree_str,
            }
            .log();
            self.emit(
                "judge_integrity_violation",
                json!({ "iteration": iteration, "worktree": worktree_str }),
            );
            JudgeResult::integrity_failure(format!("worktree {worktree_str} was modified"))
        };

        self.persist_judge_result(iteration, &verdict).await?;

        let passed = verdict.passed();
        JudgeFinished {
            iteration,
            passed,
            new_beads: verdict.new_beads.len(),
            observations: verdict.observations.len(),
        }
        .log();
        self.emit(
            "judge_finished",
            json!({
                "iteration": iteration,
                "passed": passed,
                "newBeads": verdict.new_beads.len(),
                "observations": verdict.observations.len(),
            }),
        );
        self.last_judge_summary = Some(format!(
            "{} ({} new beads, {} observations)",
            if passed { "PASS" } else { "FAIL" },
            verdict.new_beads.len(),
            verdict.observations.len()
        ));
        self.record_iteration_summary().await;

        if self.config.worktrees.cleanup {
            if let Err(err) = self.deps.worktrees.remove_worktree(&worktree).await {
                warn!(error = %err, "judge worktree cleanup failed");
            }
        }

        if passed {
            self.maybe_publish().await;
            self.transition(RunState::Completed).await?;
            return Ok(Some(RunStatus::Completed));
        }

        self.apply_remediation(&verdict).await?;

        self.checkpoint.iteration += 1;
        if self.checkpoint.iteration > self.config.judge.max_iterations {
            return Err(HarnessError::MaxIterations(
                self.config.judge.max_iterations,
            ));
        }
        self.transition(RunState::Implementing).await?;
        Ok(None)
    }

    async fn persist_judge_result(
        &self,
        iteration: u32,
        verdict: &JudgeResult,
    ) -> HarnessResult<()> {
        let dir = self.run_dir.join(JUDGE_RESULTS_DIRNAME);
        tokio::fs::create_dir_all(&dir).await?;
        let yaml = serde_yaml::to_string(verdict)?;
        tokio::fs::write(dir.join(format!("iteration-{iteration}.yml")), yaml).await?;
        Ok(())
    }

    async fn apply_remediation(&mut self, verdict: &JudgeResult) -> HarnessResult<()> {
        let label = run_label(&self.checkpoint.run_id);

        for new_bead in &verdict.new_beads {
            let id = self
                .deps
                .store
                .create(
                    &new_bead.title,
                    BeadKind::Task,
                    &[label.clone(), REMEDIATION_LABEL.to_string()],
                )
                .await?;
            for dependency in &new_bead.depends_on {
                self.deps.store.add_dependency(&id, dependency).await?;
            }
            self.checkpoint.beads.total += 1;
            if let Some(scheduler) = self.scheduler.as_mut() {
                scheduler.extend_run_bead_set([id.clone()]);
            }
            self.emit(
                "remediation_created",
                json!({ "beadId": id, "title": new_bead.title }),
            );
        }

        for observation in &verdict.observations {
            let obs_id = observation.bead_id.clone();
            match observation.action {
                ObservationDisposition::Promote => {
                    let title = observation
                        .title
                        .clone()
                        .unwrap_or_else(|| format!("Promoted observation {obs_id}"));
                    let promoted_id = self
                        .deps
                        .store
                        .create(
                            &title,
                            BeadKind::Task,
                            &[label.clone(), REMEDIATION_LABEL.to_string()],
                        )
                        .await?;
                    self.deps
                        .store
                        .close(&obs_id, Some(&format!("promoted to {promoted_id}")))
                        .await?;
                    self.checkpoint.beads.total += 1;
                    if let Some(scheduler) = self.scheduler.as_mut() {
                        scheduler.extend_run_bead_set([promoted_id.clone()]);
                    }
                    self.checkpoint.observations.promoted.push(obs_id.clone());
                    self.emit(
                        "remediation_created",
                        json!({ "beadId": promoted_id, "promotedFrom": obs_id }),
                    );
                }
                ObservationDisposition::Dismiss => {
                    self.deps
                        .store
                        .close(&obs_id, Some("dismissed by judge"))
                        .await?;
                    self.checkpoint.observations.dismissed.push(obs_id);
                }
                ObservationDisposition::Merge => {
                    let target = observation
                        .merge_into
                        .clone()
                        .unwrap_or_else(|| "unspecified".to_string());
                    self.deps
                        .store
                        .close(&obs_id, Some(&format!("merged into {target}")))
                        .await?;
                    self.checkpoint.observations.dismissed.push(obs_id);
                }
            }
        }

        let promoted = self.checkpoint.observations.promoted.clone();
        let dismissed = self.checkpoint.observations.dismissed.clone();
        self.checkpoint
            .observations
            .pending
            .retain(|id| !promoted.contains(id) && !dismissed.contains(id));

        self.checkpoints.save(&self.checkpoint).await
    }

    /// Publication is best-effort only; any failure is an event, never an
    /// error.
    async fn maybe_publish(&mut self) {
        if self.config.publish.on_complete != OnComplete::Pr {
            return;
        }
        // Only auto-derived branches are published automatically; a
        // user-supplied target branch stays theirs to publish.
        if self.config.publish.target_branch.is_some() {
            return;
        }
        let Some(publisher) = self.deps.publisher.clone() else {
            return;
        };

        let target = self.checkpoint.target_branch.clone();
        let base = self.checkpoint.base_branch.clone();
        match publisher.publish(&target, &base).await {
            Ok(reference) => {
                info!(reference, "pull request created");
                self.emit("pr_created", json!({ "reference": reference }));
            }
            Err(err) => {
                warn!(error = %err, "publication failed");
                self.emit("pr_creation_failed", json!({ "error": err.to_string() }));
            }
        }
    }

    // ------------------------------------------------------------------
    // Resume / interruption / shared plumbing
    // ------------------------------------------------------------------

    async fn reconcile_after_resume(&mut self) -> HarnessResult<()> {
        self.verify_frozen_spec().await?;
        if let Some(acceptance) = &self.checkpoint.acceptance_path {
            if !acceptance.is_file() {
                return Err(HarnessError::AcceptanceMissing(
                    acceptance.display().to_string(),
                ));
            }
        }

        // Claims from the dead process are stale: those agents are gone,
        // and the lost attempt counts against the bead's retry budget.
        let stale: Vec<String> = self.checkpoint.beads.in_progress.clone();
        for bead_id in &stale {
            self.deps
                .store
                .update_status(bead_id, BeadStatus::Open)
                .await?;
            self.checkpoint.beads.mark_open(bead_id);
            self.checkpoint.beads.increment_retry(bead_id);
        }
        self.checkpoint.agents.active.clear();
        if !stale.is_empty() {
            info!(count = stale.len(), "reset stale in-progress beads to open");
        }
        self.checkpoints.save(&self.checkpoint).await
    }

    async fn interrupt(&mut self) -> HarnessResult<RunStatus> {
        self.emit("run_interrupted", json!({ "runId": self.checkpoint.run_id }));
        self.deps.agent_backend.kill_all_active().await;
        self.deps.judge_backend.kill_all_active().await;
        self.checkpoints.save(&self.checkpoint).await?;
        Ok(RunStatus::Interrupted)
    }

    async fn verify_frozen_spec(&self) -> HarnessResult<()> {
        verify_spec_hash(
            &self.checkpoint.frozen_spec_path,
            &self.checkpoint.frozen_spec_sha256,
        )
        .await
    }

    async fn ensure_scheduler(&mut self) -> HarnessResult<()> {
        if self.scheduler.is_some() {
            return Ok(());
        }
        let run_beads = self.list_run_beads().await?;
        self.scheduler = Some(Scheduler::new(run_beads.iter().map(|b| b.id.clone())));
        Ok(())
    }

    async fn transition(&mut self, to: RunState) -> HarnessResult<()> {
        let from = self.checkpoint.state;
        if from == to {
            return Ok(());
        }
        self.checkpoint.state = to;
        PhaseChanged {
            run_id: &self.checkpoint.run_id,
            from: from.as_str(),
            to: to.as_str(),
        }
        .log();
        self.emit(
            "phase_changed",
            json!({ "from": from.as_str(), "to": to.as_str() }),
        );
        self.checkpoints.save(&self.checkpoint).await
    }

    async fn record_iteration_summary(&mut self) {
        self.run_log.record_iteration(IterationSummary {
            iteration: self.checkpoint.iteration,
            beads_total: self.checkpoint.beads.total,
            beads_completed: self.checkpoint.beads.completed.len(),
            beads_failed: self.agent_failures_iteration,
            beads_blocked: self.checkpoint.beads.blocked.len(),
            agents_spawned: self.agents_spawned_iteration,
            maintenance_runs: self.checkpoint.maintenance.run_count,
            judge: self.last_judge_summary.clone(),
        });
        self.run_log_writer.write(&self.run_log).await;
    }

    fn emit(&self, event: &str, fields: serde_json::Value) {
        if let Some(events) = &self.events {
            events.emit(event, fields);
        }
    }
}

/// Most recently created run directory under the storage root.
async fn newest_run_dir(storage_root: &Path) -> HarnessResult<PathBuf> {
    let mut entries = tokio::fs::read_dir(storage_root).await.map_err(|err| {
        HarnessError::CheckpointCorrupt(format!(
            "no runs to resume under {}: {err}",
            storage_root.display()
        ))
    })?;

    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with("run-") {
            continue;
        }
        let metadata = entry.metadata().await?;
        let stamp = metadata.created().or_else(|_| metadata.modified())?;
        if newest.as_ref().map(|(t, _)| stamp > *t).unwrap_or(true) {
            newest = Some((stamp, path));
        }
    }

    newest.map(|(_, path)| path).ok_or_else(|| {
        HarnessError::CheckpointCorrupt(format!(
            "no run directories under {}",
            storage_root.display()
        ))
    })
}

fn build_coding_prompt(bead: &Bead, dependency_lines: &[String], target_branch: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!("# Task: {}\n\n", bead.title));
    prompt.push_str(&format!(
        "**Bead:** {} | **Branch:** {}\n\n",
        bead.id, target_branch
    ));
    if let Some(description) = &bead.description {
        prompt.push_str(description);
        prompt.push_str("\n\n");
    }
    if !dependency_lines.is_empty() {
        prompt.push_str("## Resolved dependencies\n");
        for line in dependency_lines {
            prompt.push_str(&format!("- {line}\n"));
        }
        prompt.push('\n');
    }
    prompt.push_str(&format!(
        "Implement this bead in the current worktree, commit your work, and close bead {} \
         in the tracker when the work is done.\n",
        bead.id
    ));
    prompt
}
