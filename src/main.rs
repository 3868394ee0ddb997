// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use specforge::backends::{ensure_tools_available, ProcessAgentBackend, ProcessJudgeBackend};
use specforge::beads::CliBeadStore;
use specforge::config::load_and_validate_config;
use specforge::engine::{Collaborators, Orchestrator, RunOptions, RunStatus};
use specforge::errors::HarnessError;
use specforge::workspace::{GitPublisher, GitWorktreeManager};

/// Exit code for an interrupted run, per shell convention (128 + SIGINT).
const EXIT_INTERRUPTED: u8 = 130;

fn usage(program: &str) {
    eprintln!("Usage: {program} <config.yml> [--resume] [--dry-run]");
    eprintln!("Example: {program} specforge.yml");
    eprintln!("Example: {program} specforge.yml --resume");
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        usage(&args[0]);
        return ExitCode::from(2);
    }

    let config_path = &args[1];
    let mut options = RunOptions::default();
    for flag in &args[2..] {
        match flag.as_str() {
            "--resume" => options.resume = true,
            "--dry-run" => options.dry_run = true,
            other => {
                eprintln!("Unknown flag: {other}");
                usage(&args[0]);
                return ExitCode::from(2);
            }
        }
    }

    match run(config_path, options).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{}: {}", err.code(), err);
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

async fn run(config_path: &str, options: RunOptions) -> Result<ExitCode, HarnessError> {
    let config = load_and_validate_config(config_path)?;

    let mut tools: Vec<&str> = config.agents.tools.iter().map(String::as_str).collect();
    if config.judge.enabled {
        tools.extend(config.judge.tools.iter().map(String::as_str));
    }
    ensure_tools_available(tools.into_iter())?;

    let prepared = Orchestrator::prepare(&config, options).await?;
    let repo_root = config
        .repo_root
        .clone()
        .unwrap_or_else(|| std::path::PathBuf::from("."));

    let deps = Collaborators {
        store: Arc::new(CliBeadStore::new(config.store.command.clone(), &repo_root)),
        agent_backend: Arc::new(ProcessAgentBackend::new(config.agents.tools.clone())),
        judge_backend: Arc::new(ProcessJudgeBackend::new(config.judge.tools.clone())),
        worktrees: Arc::new(GitWorktreeManager::new(
            &repo_root,
            prepared.worktrees_root(),
            prepared.target_branch(),
            prepared.base_branch(),
        )),
        publisher: Some(Arc::new(GitPublisher::new(
            &repo_root,
            prepared.run_id().to_string(),
        ))),
    };

    let orchestrator = Orchestrator::bootstrap(config, deps, prepared).await?;

    // SIGINT/SIGTERM cancel the run; the orchestrator kills active agent
    // process groups and persists its checkpoint before unwinding.
    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("sigterm handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        cancel.cancel();
    });

    let outcome = orchestrator.run(options).await?;

    match outcome.status {
        RunStatus::Interrupted => {
            eprintln!("Run {} interrupted; resume with --resume", outcome.run_id);
            Ok(ExitCode::from(EXIT_INTERRUPTED))
        }
        RunStatus::DryRun => {
            println!("Run {} (dry run)", outcome.run_id);
            println!("Planned schedule for {} beads:", outcome.beads_total);
            for (index, bead_id) in outcome
                .schedule_preview
                .unwrap_or_default()
                .iter()
                .enumerate()
            {
                println!("  {}. {bead_id}", index + 1);
            }
            Ok(ExitCode::SUCCESS)
        }
        RunStatus::Completed => {
            println!("Run {} completed", outcome.run_id);
            println!("  iterations:      {}", outcome.iterations);
            println!(
                "  beads completed: {}/{}",
                outcome.beads_completed, outcome.beads_total
            );
            println!("  agents spawned:  {}", outcome.agents_spawned);
            Ok(ExitCode::SUCCESS)
        }
    }
}
