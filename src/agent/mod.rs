// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Agent process management and the LLM-driven adapters built on it.
//!
//! - [`manager`] - owns the running agent subprocesses, drives the spawn
//!   handshake, routes notifications, and signals turn completion
//! - [`orchestrator`] - decomposes a user task into a dependency graph
//! - [`merger`] - merges completed task branches, using an agent to resolve
//!   textual conflicts
//!
//! The executor and the adapters consume agents through the [`AgentRuntime`]
//! trait rather than the concrete manager, which keeps the seam mockable.

pub mod manager;
pub mod merger;
pub mod orchestrator;
pub mod types;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::AgentError;

pub use manager::{AgentInstance, AgentManager};
pub use merger::{MergePlan, MergeResult, MergeStrategy, Merger};
pub use orchestrator::{Orchestrator, TaskDecomposition, TaskSuggestion};
pub use types::{AgentConfig, AgentEvent, AgentRole, AgentState};

/// The operations the rest of the system needs from running agents.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Spawn and initialise a new agent instance.
    async fn spawn_agent(
        &self,
        config: AgentConfig,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError>;

    /// Send a task message to an idle agent, starting a turn.
    async fn send_task(
        &self,
        agent_id: &str,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError>;

    /// Block until the agent's current turn completes or `cancel` fires.
    async fn wait_for_completion(
        &self,
        agent_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError>;

    /// Tear an agent down: close its stdin, wait for exit, deregister.
    async fn stop_agent(&self, agent_id: &str) -> Result<(), AgentError>;

    /// The agent's accumulated message output.
    async fn output(&self, agent_id: &str) -> String;
}
