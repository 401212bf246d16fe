// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Core types for agent instances.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rpc::SandboxMode;

/// An agent's role in the orchestration system. The role decides the default
/// sandbox mode: orchestrators only read, workers and mergers write to their
/// workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Orchestrator,
    Worker,
    Merger,
}

impl AgentRole {
    /// The sandbox mode used when the config does not set one explicitly.
    pub fn default_sandbox(&self) -> SandboxMode {
        match self {
            Self::Orchestrator => SandboxMode::ReadOnly,
            Self::Worker | Self::Merger => SandboxMode::WorkspaceWrite,
        }
    }
}

/// Lifecycle state of an agent instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Idle,
    Running,
    Completed,
    Failed,
}

/// Configuration for spawning a new agent instance.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Unique agent ID within the manager.
    pub id: String,
    pub role: AgentRole,
    /// Working directory for the agent's thread.
    pub cwd: PathBuf,
    /// Explicit sandbox mode; the role's default applies when unset.
    pub sandbox: Option<SandboxMode>,
    pub base_instructions: Option<String>,
    pub developer_instructions: Option<String>,
}

impl AgentConfig {
    /// Create a config with the required fields.
    pub fn new(id: impl Into<String>, role: AgentRole, cwd: impl AsRef<Path>) -> Self {
        Self {
            id: id.into(),
            role,
            cwd: cwd.as_ref().to_path_buf(),
            sandbox: None,
            base_instructions: None,
            developer_instructions: None,
        }
    }

    /// Set an explicit sandbox mode.
    pub fn with_sandbox(mut self, sandbox: SandboxMode) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    /// Set the base instructions for the agent's thread.
    pub fn with_base_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.base_instructions = Some(instructions.into());
        self
    }

    /// Set the developer instructions for the agent's thread.
    pub fn with_developer_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.developer_instructions = Some(instructions.into());
        self
    }

    /// The sandbox mode this config resolves to.
    pub fn resolved_sandbox(&self) -> SandboxMode {
        self.sandbox.unwrap_or_else(|| self.role.default_sandbox())
    }
}

/// An event emitted by the agent manager: lifecycle markers (`spawned`,
/// `stopped`) and every notification forwarded from the subprocess.
#[derive(Debug, Clone)]
pub struct AgentEvent {
    pub agent_id: String,
    pub event_type: String,
    pub data: Value,
}

impl AgentEvent {
    pub fn new(agent_id: impl Into<String>, event_type: impl Into<String>, data: Value) -> Self {
        Self {
            agent_id: agent_id.into(),
            event_type: event_type.into(),
            data,
        }
    }
}
