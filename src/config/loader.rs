// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Run configuration, loaded from a YAML file.
//!
//! Every section has serde defaults so a minimal config is just a spec
//! path; `load_and_validate_config` is the entry the binary uses.
//!
//! # Example
//! ```yaml
//! spec_path: specs/billing.md
//! decompose:
//!   existing_selector: billing-work
//! agents:
//!   max_concurrency: 3
//!   tools: [claude]
//! judge:
//!   enabled: true
//!   max_iterations: 3
//! maintenance:
//!   trigger: every_n_beads
//!   every_n: 4
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::config::consts::{
    DEFAULT_BEAD_TIMEOUT_SECS, DEFAULT_MAINTENANCE_EVERY_N, DEFAULT_MAX_CONCURRENCY,
    DEFAULT_MAX_ITERATIONS, DEFAULT_MAX_RETRIES_PER_BEAD, DEFAULT_STORAGE_DIR,
    DEFAULT_STORE_COMMAND,
};
use crate::errors::{HarnessError, HarnessResult};

/// Top-level run configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// The natural-language spec driving this run.
    pub spec_path: PathBuf,
    /// Repository the run operates on; defaults to the current directory.
    #[serde(default)]
    pub repo_root: Option<PathBuf>,
    /// State directory name under the repo root.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: String,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub decompose: DecomposeConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub judge: JudgeConfig,
    #[serde(default)]
    pub worktrees: WorktreeConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub acceptance: AcceptanceConfig,
}

fn default_storage_dir() -> String {
    DEFAULT_STORAGE_DIR.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Bead store CLI command name or path.
    #[serde(default = "default_store_command")]
    pub command: String,
}

fn default_store_command() -> String {
    DEFAULT_STORE_COMMAND.to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            command: default_store_command(),
        }
    }
}

/// How the run bead set comes to exist.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DecomposeConfig {
    /// Scope the run to beads already carrying this label. When absent,
    /// an agent decomposes the frozen spec into fresh beads.
    #[serde(default)]
    pub existing_selector: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentsConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_bead_timeout")]
    pub bead_timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries_per_bead: u32,
    /// Concrete coding tools; more than one means a random pick per spawn.
    #[serde(default = "default_tools")]
    pub tools: Vec<String>,
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

fn default_bead_timeout() -> u64 {
    DEFAULT_BEAD_TIMEOUT_SECS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES_PER_BEAD
}

fn default_tools() -> Vec<String> {
    vec!["claude".to_string()]
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            bead_timeout_seconds: default_bead_timeout(),
            max_retries_per_bead: default_max_retries(),
            tools: default_tools(),
        }
    }
}

/// When maintenance runs interleave with implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceTrigger {
    #[default]
    Disabled,
    EveryNBeads,
    AfterAll,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceConfig {
    #[serde(default)]
    pub trigger: MaintenanceTrigger,
    #[serde(default = "default_every_n")]
    pub every_n: usize,
}

fn default_every_n() -> usize {
    DEFAULT_MAINTENANCE_EVERY_N
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            trigger: MaintenanceTrigger::default(),
            every_n: default_every_n(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JudgeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Judge tools; same random-choice rule as agent tools.
    #[serde(default = "default_tools")]
    pub tools: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_iterations: default_max_iterations(),
            tools: default_tools(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorktreeConfig {
    /// Tear down terminal beads' worktrees as the run progresses.
    #[serde(default = "default_true")]
    pub cleanup: bool,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self { cleanup: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnComplete {
    #[default]
    None,
    Pr,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublishConfig {
    #[serde(default)]
    pub on_complete: OnComplete,
    /// Integration branch name; absent means derive one from the run id.
    #[serde(default)]
    pub target_branch: Option<String>,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
}

fn default_base_branch() -> String {
    "main".to_string()
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            on_complete: OnComplete::default(),
            target_branch: None,
            base_branch: default_base_branch(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AcceptanceConfig {
    /// Generate acceptance criteria from the frozen spec at freeze time.
    #[serde(default)]
    pub generate: bool,
}

/// Load a config from a YAML file.
pub fn load_config<P: AsRef<Path>>(path: P) -> HarnessResult<Config> {
    let content = fs::read_to_string(path.as_ref()).map_err(|err| {
        HarnessError::ConfigInvalid(format!("{}: {err}", path.as_ref().display()))
    })?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    Ok(cfg)
}

/// Load and validate a config from a YAML file.
pub fn load_and_validate_config<P: AsRef<Path>>(path: P) -> HarnessResult<Config> {
    let cfg = load_config(path)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &Config) -> HarnessResult<()> {
    if cfg.spec_path.as_os_str().is_empty() {
        return Err(HarnessError::ConfigInvalid("spec_path is empty".into()));
    }
    if let Some(selector) = &cfg.decompose.existing_selector {
        if selector.trim().is_empty() {
            return Err(HarnessError::ConfigInvalid(
                "decompose.existing_selector is empty".into(),
            ));
        }
    }
    if cfg.agents.tools.is_empty() {
        return Err(HarnessError::ConfigInvalid("agents.tools is empty".into()));
    }
    if cfg.agents.max_concurrency == 0 {
        return Err(HarnessError::ConfigInvalid(
            "agents.max_concurrency must be at least 1".into(),
        ));
    }
    if cfg.judge.enabled {
        if cfg.judge.tools.is_empty() {
            return Err(HarnessError::ConfigInvalid("judge.tools is empty".into()));
        }
        if cfg.judge.max_iterations == 0 {
            return Err(HarnessError::ConfigInvalid(
                "judge.max_iterations must be at least 1".into(),
            ));
        }
    }
    if cfg.maintenance.trigger == MaintenanceTrigger::EveryNBeads && cfg.maintenance.every_n == 0 {
        return Err(HarnessError::ConfigInvalid(
            "maintenance.every_n must be at least 1".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config_uses_defaults() {
        let yaml = "spec_path: specs/billing.md\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(cfg.spec_path, PathBuf::from("specs/billing.md"));
        assert_eq!(cfg.storage_dir, ".specforge");
        assert_eq!(cfg.store.command, "tbd");
        assert!(cfg.decompose.existing_selector.is_none());
        assert_eq!(cfg.agents.max_concurrency, 2);
        assert_eq!(cfg.agents.bead_timeout_seconds, 1800);
        assert_eq!(cfg.maintenance.trigger, MaintenanceTrigger::Disabled);
        assert!(cfg.judge.enabled);
        assert!(cfg.worktrees.cleanup);
        assert_eq!(cfg.publish.on_complete, OnComplete::None);
        assert_eq!(cfg.publish.base_branch, "main");
    }

    #[test]
    fn parse_full_config() {
        let yaml = r#"
spec_path: specs/billing.md
storage_dir: .runs
store:
  command: beads
decompose:
  existing_selector: billing-work
agents:
  max_concurrency: 4
  bead_timeout_seconds: 600
  max_retries_per_bead: 1
  tools: [claude, aider]
maintenance:
  trigger: every_n_beads
  every_n: 3
judge:
  enabled: true
  max_iterations: 5
publish:
  on_complete: pr
  base_branch: develop
acceptance:
  generate: true
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.storage_dir, ".runs");
        assert_eq!(cfg.store.command, "beads");
        assert_eq!(cfg.decompose.existing_selector.as_deref(), Some("billing-work"));
        assert_eq!(cfg.agents.tools, vec!["claude", "aider"]);
        assert_eq!(cfg.maintenance.trigger, MaintenanceTrigger::EveryNBeads);
        assert_eq!(cfg.maintenance.every_n, 3);
        assert_eq!(cfg.judge.max_iterations, 5);
        assert_eq!(cfg.publish.on_complete, OnComplete::Pr);
        assert!(cfg.acceptance.generate);
    }

    #[test]
    fn load_and_validate_rejects_empty_selector() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(
            &path,
            "spec_path: s.md\ndecompose:\n  existing_selector: \"  \"\n",
        )
        .unwrap();

        let err = load_and_validate_config(&path).unwrap_err();
        assert_eq!(err.code(), "E_CONFIG_INVALID");
    }

    #[test]
    fn load_and_validate_rejects_zero_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, "spec_path: s.md\nagents:\n  max_concurrency: 0\n").unwrap();

        let err = load_and_validate_config(&path).unwrap_err();
        assert_eq!(err.code(), "E_CONFIG_INVALID");
    }

    #[test]
    fn load_and_validate_accepts_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, "spec_path: s.md\n").unwrap();

        let cfg = load_and_validate_config(&path).unwrap();
        assert_eq!(cfg.spec_path, PathBuf::from("s.md"));
    }

    #[test]
    fn missing_file_is_config_invalid() {
        let err = load_config("/no/such/config.yml").unwrap_err();
        assert_eq!(err.code(), "E_CONFIG_INVALID");
    }
}
