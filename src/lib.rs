// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! codecrew - a team of coding agents for one task.
//!
//! codecrew orchestrates LLM coding agents against a local git repository:
//! a read-only agent decomposes the user's task into a dependency graph of
//! sub-tasks, worker agents execute ready tasks in parallel inside isolated
//! git worktrees, and a merge agent folds the resulting branches back into a
//! single line of history, resolving textual conflicts itself.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`error`] - Error types and result aliases
//! - [`config`] - Configuration loading and merging
//! - [`telemetry`] - Tracing initialization
//! - [`rpc`] - JSON-RPC transport to agent app-server subprocesses
//! - [`agent`] - Agent process manager, decomposer, and merge driver
//! - [`task`] - Task DAG and the parallel executor
//! - [`workspace`] - Isolated git worktree workspaces
//! - [`session`] - Sessions tying one user task to a graph, agents, and
//!   workspaces
//!
//! # Example
//!
//! ```rust,ignore
//! use codecrew::config::Config;
//! use codecrew::session::SessionManager;
//! use tokio_util::sync::CancellationToken;
//!
//! let config = Config::load(std::path::Path::new("."))?;
//! let manager = SessionManager::new(config);
//!
//! let session = manager.create("add OAuth2 login").await;
//! let cancel = CancellationToken::new();
//! session.decompose(&cancel).await?;
//! session.execute(&cancel).await?;
//! session.merge(&cancel).await?;
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod rpc;
pub mod session;
pub mod task;
pub mod telemetry;
pub mod workspace;

// Re-export commonly used types at crate root
pub use agent::{
    AgentConfig, AgentManager, AgentRole, AgentRuntime, AgentState, MergePlan, MergeResult,
    MergeStrategy, Merger, Orchestrator,
};
pub use config::Config;
pub use error::{
    AgentError, ConfigError, DagError, ExecutorError, MergeError, Result, SessionError,
};
pub use session::{Session, SessionManager, SessionStatus};
pub use task::{Dag, Executor, Task, TaskStatus};
pub use workspace::{GitWorktreeProvider, WorkspaceProvider, Worktree};

/// codecrew version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
