// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Subprocess-backed agent and judge tools.
//!
//! Invocation contract: the tool runs in the worktree with the prompt on
//! stdin, `SPECFORGE_*` environment variables for structured inputs, and
//! its own process group so a timeout or interrupt can kill the whole tool
//! tree at once. The judge prints its verdict document (YAML) to stdout.
//!
//! When more than one tool is configured, each spawn picks one at random;
//! a single-element list is a deterministic choice.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::errors::{HarnessError, HarnessResult};
use crate::traits::backend::OutputFormat;
use crate::traits::{
    AgentBackend, AgentResult, AgentSpawnOpts, JudgeBackend, JudgeOpts, JudgeResult, ProcessResult,
};

/// Lines of trailing output retained for diagnostics.
const OUTPUT_TAIL_LINES: usize = 100;

fn kill_process_group(pid: u32) {
    // Negative pid targets the whole group.
    unsafe {
        libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
    }
}

async fn collect_tail<R>(reader: R, tail: Arc<std::sync::Mutex<VecDeque<String>>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut tail = tail.lock().expect("tail lock poisoned");
        if tail.len() == OUTPUT_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

/// What to do with the child's stdout.
#[derive(Clone, Copy, PartialEq)]
enum StdoutCapture {
    /// Fold stdout into the diagnostic tail alongside stderr.
    Tail,
    /// Keep stdout whole and separate; only stderr feeds the tail. Used by
    /// the judge, whose stdout *is* the verdict document.
    Full,
}

/// Run one tool to completion or timeout. Returns the process result and,
/// under `StdoutCapture::Full`, the complete stdout text.
async fn run_tool(
    tool: &str,
    workdir: &Path,
    stdin_payload: &str,
    env: &HashMap<String, String>,
    timeout: Duration,
    capture: StdoutCapture,
    active: &Mutex<HashSet<u32>>,
) -> HarnessResult<(ProcessResult, Option<String>)> {
    let mut command = Command::new(tool);
    command
        .current_dir(workdir)
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let started = Instant::now();
    let mut child = command.spawn().map_err(|err| {
        HarnessError::BackendUnavailable(format!("failed to spawn '{tool}': {err}"))
    })?;
    let pid = child.id();
    if let Some(pid) = pid {
        active.lock().await.insert(pid);
    }

    if let Some(mut stdin) = child.stdin.take() {
        let payload = stdin_payload.to_string();
        tokio::spawn(async move {
            let _ = stdin.write_all(payload.as_bytes()).await;
            let _ = stdin.shutdown().await;
        });
    }

    let tail = Arc::new(std::sync::Mutex::new(VecDeque::with_capacity(
        OUTPUT_TAIL_LINES,
    )));
    let full_stdout = Arc::new(std::sync::Mutex::new(String::new()));
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        match capture {
            StdoutCapture::Tail => readers.push(tokio::spawn(collect_tail(stdout, tail.clone()))),
            StdoutCapture::Full => {
                let sink = full_stdout.clone();
                readers.push(tokio::spawn(async move {
                    let mut lines = BufReader::new(stdout).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let mut sink = sink.lock().expect("stdout lock poisoned");
                        sink.push_str(&line);
                        sink.push('\n');
                    }
                }));
            }
        }
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(collect_tail(stderr, tail.clone())));
    }

    let waited = tokio::time::timeout(timeout, child.wait()).await;

    let (exit_code, timed_out) = match waited {
        Ok(Ok(status)) => (status.code().unwrap_or(-1), false),
        Ok(Err(err)) => {
            if let Some(pid) = pid {
                active.lock().await.remove(&pid);
            }
            return Err(HarnessError::ConfigInvalid(format!(
                "waiting on '{tool}' failed: {err}"
            )));
        }
        Err(_) => {
            if let Some(pid) = pid {
                kill_process_group(pid);
            }
            let _ = child.wait().await; // reap after the group kill
            (-1, true)
        }
    };

    if let Some(pid) = pid {
        active.lock().await.remove(&pid);
    }
    for reader in readers {
        let _ = reader.await;
    }

    let last_lines = {
        let tail = tail.lock().expect("tail lock poisoned");
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    };
    let stdout_text = match capture {
        StdoutCapture::Tail => None,
        StdoutCapture::Full => Some(full_stdout.lock().expect("stdout lock poisoned").clone()),
    };

    Ok((
        ProcessResult {
            exit_code,
            last_lines,
            duration: started.elapsed(),
            timed_out,
            pid,
        },
        stdout_text,
    ))
}

async fn kill_active_groups(active: &Mutex<HashSet<u32>>) {
    let pids: Vec<u32> = active.lock().await.iter().copied().collect();
    for pid in pids {
        debug!(pid, "killing active process group");
        kill_process_group(pid);
    }
}

fn choose_tool<'a>(tools: &'a [String]) -> HarnessResult<&'a str> {
    tools
        .choose(&mut rand::thread_rng())
        .map(String::as_str)
        .ok_or_else(|| HarnessError::BackendUnavailable("no tools configured".into()))
}

/// Coding-agent backend spawning one tool per bead attempt.
pub struct ProcessAgentBackend {
    tools: Vec<String>,
    active: Mutex<HashSet<u32>>,
}

impl ProcessAgentBackend {
    pub fn new(tools: Vec<String>) -> Self {
        Self {
            tools,
            active: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl AgentBackend for ProcessAgentBackend {
    async fn spawn(&self, opts: AgentSpawnOpts) -> HarnessResult<AgentResult> {
        let tool = choose_tool(&self.tools)?;

        let mut env = opts.env.clone();
        if let Some(system_prompt) = &opts.system_prompt {
            env.insert("SPECFORGE_SYSTEM_PROMPT".into(), system_prompt.clone());
        }
        if opts.output_format == OutputFormat::Json {
            env.insert("SPECFORGE_OUTPUT_FORMAT".into(), "json".into());
        }

        let (process, _) = run_tool(
            tool,
            &opts.workdir,
            &opts.prompt,
            &env,
            opts.timeout,
            StdoutCapture::Tail,
            &self.active,
        )
        .await?;

        if process.timed_out {
            warn!(tool, duration = ?process.duration, "agent timed out");
        }
        Ok(process.into())
    }

    async fn kill_all_active(&self) {
        kill_active_groups(&self.active).await;
    }
}

/// Judge backend: spawns a tool and parses its stdout verdict.
pub struct ProcessJudgeBackend {
    tools: Vec<String>,
    active: Mutex<HashSet<u32>>,
}

impl ProcessJudgeBackend {
    pub fn new(tools: Vec<String>) -> Self {
        Self {
            tools,
            active: Mutex::new(HashSet::new()),
        }
    }

    fn parse_verdict(raw: &str) -> HarnessResult<JudgeResult> {
        serde_yaml::from_str(raw)
            .map_err(|err| HarnessError::JudgeParseFailed(format!("verdict not schema-valid: {err}")))
    }
}

#[async_trait]
impl JudgeBackend for ProcessJudgeBackend {
    async fn evaluate(&self, opts: JudgeOpts) -> HarnessResult<JudgeResult> {
        let tool = choose_tool(&self.tools)?;

        let mut env = opts.env.clone();
        env.insert(
            "SPECFORGE_FROZEN_SPEC".into(),
            opts.frozen_spec_path.display().to_string(),
        );
        if let Some(acceptance) = &opts.acceptance_path {
            env.insert(
                "SPECFORGE_ACCEPTANCE".into(),
                acceptance.display().to_string(),
            );
        }
        env.insert(
            "SPECFORGE_OBSERVATION_BEADS".into(),
            opts.observation_bead_ids.join(","),
        );

        let prompt = format!(
            "Evaluate the workspace against the frozen spec at {} and print a YAML verdict \
             with specDrift, acceptance, observations, and newBeads.",
            opts.frozen_spec_path.display()
        );

        let (process, stdout) = run_tool(
            tool,
            &opts.workdir,
            &prompt,
            &env,
            opts.timeout,
            StdoutCapture::Full,
            &self.active,
        )
        .await?;

        if process.timed_out {
            return Err(HarnessError::JudgeParseFailed(format!(
                "judge '{tool}' timed out after {:?}",
                process.duration
            )));
        }
        if process.exit_code != 0 {
            return Err(HarnessError::JudgeParseFailed(format!(
                "judge '{tool}' exited with {}: {}",
                process.exit_code, process.last_lines
            )));
        }
        Self::parse_verdict(stdout.as_deref().unwrap_or_default())
    }

    async fn kill_all_active(&self) {
        kill_active_groups(&self.active).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::AgentStatus;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    fn write_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn agent_opts(workdir: &Path, timeout: Duration) -> AgentSpawnOpts {
        AgentSpawnOpts::new(workdir.to_path_buf(), "prompt text".into(), timeout)
    }

    #[tokio::test]
    async fn successful_tool_maps_to_success() {
        let dir = tempfile::tempdir().unwrap();
        let tool = write_tool(dir.path(), "agent.sh", "cat > /dev/null; echo done; exit 0");

        let backend = ProcessAgentBackend::new(vec![tool.display().to_string()]);
        let result = backend
            .spawn(agent_opts(dir.path(), Duration::from_secs(10)))
            .await
            .unwrap();

        assert_eq!(result.status, AgentStatus::Success);
        assert_eq!(result.exit_code, 0);
        assert!(result.last_lines.contains("done"));
        assert!(result.pid.is_some());
    }

    #[tokio::test]
    async fn failing_tool_maps_to_failure_with_tail() {
        let dir = tempfile::tempdir().unwrap();
        let tool = write_tool(
            dir.path(),
            "agent.sh",
            "cat > /dev/null; echo 'compile error' >&2; exit 3",
        );

        let backend = ProcessAgentBackend::new(vec![tool.display().to_string()]);
        let result = backend
            .spawn(agent_opts(dir.path(), Duration::from_secs(10)))
            .await
            .unwrap();

        assert_eq!(result.status, AgentStatus::Failure);
        assert_eq!(result.exit_code, 3);
        assert!(result.last_lines.contains("compile error"));
    }

    #[tokio::test]
    async fn timeout_kills_and_dominates() {
        let dir = tempfile::tempdir().unwrap();
        let tool = write_tool(dir.path(), "agent.sh", "sleep 30");

        let backend = ProcessAgentBackend::new(vec![tool.display().to_string()]);
        let started = Instant::now();
        let result = backend
            .spawn(agent_opts(dir.path(), Duration::from_millis(200)))
            .await
            .unwrap();

        assert_eq!(result.status, AgentStatus::Timeout);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn prompt_arrives_on_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let tool = write_tool(dir.path(), "agent.sh", "cat > received.txt");

        let backend = ProcessAgentBackend::new(vec![tool.display().to_string()]);
        backend
            .spawn(agent_opts(dir.path(), Duration::from_secs(10)))
            .await
            .unwrap();

        let received = std::fs::read_to_string(dir.path().join("received.txt")).unwrap();
        assert_eq!(received, "prompt text");
    }

    #[tokio::test]
    async fn judge_verdict_is_parsed_from_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let tool = write_tool(
            dir.path(),
            "judge.sh",
            r#"cat > /dev/null
cat <<'EOF'
specDrift:
  detected: false
acceptance:
  passed: true
  summary: all criteria met
EOF"#,
        );

        let backend = ProcessJudgeBackend::new(vec![tool.display().to_string()]);
        let verdict = backend
            .evaluate(JudgeOpts {
                workdir: dir.path().to_path_buf(),
                frozen_spec_path: dir.path().join("frozen-spec.md"),
                acceptance_path: None,
                observation_bead_ids: vec![],
                timeout: Duration::from_secs(10),
                env: HashMap::new(),
            })
            .await
            .unwrap();

        assert!(verdict.passed());
    }

    #[tokio::test]
    async fn judge_garbage_output_is_parse_failure() {
        let dir = tempfile::tempdir().unwrap();
        let tool = write_tool(dir.path(), "judge.sh", "cat > /dev/null; echo ':::not yaml:::'");

        let backend = ProcessJudgeBackend::new(vec![tool.display().to_string()]);
        let err = backend
            .evaluate(JudgeOpts {
                workdir: dir.path().to_path_buf(),
                frozen_spec_path: dir.path().join("frozen-spec.md"),
                acceptance_path: None,
                observation_bead_ids: vec![],
                timeout: Duration::from_secs(10),
                env: HashMap::new(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E_JUDGE_PARSE_FAILED");
    }

    #[tokio::test]
    async fn missing_tool_is_backend_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ProcessAgentBackend::new(vec!["/no/such/tool".into()]);
        let err = backend
            .spawn(agent_opts(dir.path(), Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E_BACKEND_UNAVAILABLE");
    }
}
