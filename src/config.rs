// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration loading.
//!
//! Sources are merged with precedence CLI > environment > workspace file >
//! defaults. The workspace file is `.codecrew.json` at the repository root.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Name of the workspace config file.
pub const CONFIG_FILE: &str = ".codecrew.json";

/// Environment variable prefix for overrides.
const ENV_PREFIX: &str = "CODECREW_";

/// Resolved configuration for a session manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Path to the agent binary spawned in app-server mode.
    pub agent_bin: PathBuf,
    /// Repository the sessions operate on.
    pub repo_path: PathBuf,
    /// Maximum number of concurrently running tasks.
    pub max_parallel: usize,
    /// Branch that completed task branches are merged into.
    pub base_branch: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent_bin: PathBuf::from("codex"),
            repo_path: PathBuf::from("."),
            max_parallel: 3,
            base_branch: "main".to_string(),
        }
    }
}

impl Config {
    /// Load configuration for a workspace: the config file if present, then
    /// environment overrides.
    pub fn load(workspace_root: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_file(workspace_root)?.unwrap_or_default();
        if config.repo_path == PathBuf::from(".") {
            config.repo_path = workspace_root.to_path_buf();
        }
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn load_file(workspace_root: &Path) -> Result<Option<Self>, ConfigError> {
        let path = workspace_root.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(Some(config))
    }

    fn apply_env(&mut self) {
        if let Ok(bin) = std::env::var(format!("{ENV_PREFIX}AGENT_BIN")) {
            if !bin.is_empty() {
                self.agent_bin = PathBuf::from(bin);
            }
        }
        if let Ok(parallel) = std::env::var(format!("{ENV_PREFIX}MAX_PARALLEL")) {
            if let Ok(value) = parallel.parse::<usize>() {
                self.max_parallel = value;
            }
        }
        if let Ok(branch) = std::env::var(format!("{ENV_PREFIX}BASE_BRANCH")) {
            if !branch.is_empty() {
                self.base_branch = branch;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel == 0 {
            return Err(ConfigError::InvalidValue {
                field: "maxParallel".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.base_branch.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "baseBranch".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}
