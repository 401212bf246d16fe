// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the codecrew orchestrator.
//!
//! This module provides strongly-typed errors for the different parts of the
//! application, using `thiserror` for ergonomic error definitions and `anyhow`
//! for error propagation. Errors that only matter inside a single module
//! (`WorkspaceError`, `RpcClientError`) live next to their module instead.

use thiserror::Error;

use crate::rpc::client::RpcClientError;
use crate::workspace::WorkspaceError;

/// Errors raised by the task graph.
#[derive(Error, Debug)]
pub enum DagError {
    #[error("task already exists: {0}")]
    TaskExists(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("cycle detected in task graph")]
    CycleDetected,
}

/// Errors that can occur during agent operations.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("agent already exists: {0}")]
    AlreadyExists(String),

    #[error("agent not found: {0}")]
    NotFound(String),

    #[error("failed to spawn agent process: {0}")]
    SpawnFailed(String),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcClientError),

    #[error("agent turn failed: {0}")]
    TurnFailed(String),

    #[error("agent output was not decodable: {0}")]
    InvalidOutput(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl AgentError {
    /// Check if this error was caused by cancellation rather than a fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Rpc(RpcClientError::Cancelled)
        )
    }
}

/// Errors raised while driving a DAG to completion.
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("cycle detected in task graph")]
    CycleDetected,

    #[error("workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("merge of dependency branch {branch} failed: {message}")]
    DependencyMerge { branch: String, message: String },

    #[error("agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("execution cancelled")]
    Cancelled,

    #[error("one or more tasks failed")]
    TasksFailed,
}

impl ExecutorError {
    /// Check if this error was caused by cancellation rather than a fault.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Agent(e) => e.is_cancelled(),
            _ => false,
        }
    }
}

/// Errors raised by the merge driver.
#[derive(Error, Debug)]
pub enum MergeError {
    #[error("workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("agent error: {0}")]
    Agent(#[from] AgentError),
}

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("invalid session state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    #[error("decomposition failed: {0}")]
    Decompose(#[source] AgentError),

    #[error("failed to build task graph: {0}")]
    Graph(#[from] DagError),

    #[error("execution failed: {0}")]
    Execution(#[from] ExecutorError),

    #[error("merge failed for branches: {}", .branches.join(", "))]
    MergeFailed { branches: Vec<String> },

    #[error("merge driver error: {0}")]
    Merge(#[from] MergeError),
}

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("IO error reading config: {0}")]
    IoError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError(err.to_string())
    }
}

/// Result type alias using anyhow for flexible error handling.
pub type Result<T> = anyhow::Result<T>;
