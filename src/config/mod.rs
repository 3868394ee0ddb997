// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

pub mod consts;
mod loader;

pub use loader::{
    AcceptanceConfig, AgentsConfig, Config, DecomposeConfig, JudgeConfig, MaintenanceConfig,
    MaintenanceTrigger, OnComplete, PublishConfig, StoreConfig, WorktreeConfig,
    load_and_validate_config, load_config,
};
