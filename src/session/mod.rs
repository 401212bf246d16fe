// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Sessions: one user task from decomposition to merged history.
//!
//! A [`Session`] bundles a task graph, the shared agent runtime, a workspace
//! provider for its repository, and the decomposer/merger adapters. The
//! aggregate status is monotonic (`created` through `completed`), except
//! that `failed` is absorbing and reachable from any non-terminal state.
//!
//! [`SessionManager`] owns the shared collaborators and the registry of
//! sessions; the HTTP layer (out of scope here) calls `decompose`,
//! `execute`, and `merge` on sessions and subscribes to their event stream.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::agent::{AgentManager, AgentRuntime, Merger, Orchestrator};
use crate::config::Config;
use crate::error::SessionError;
use crate::task::{Dag, ExecutionEventKind, Executor, Task, TaskStatus};
use crate::workspace::{GitWorktreeProvider, WorkspaceProvider};

/// Capacity of a session's event channel.
const EVENT_CAPACITY: usize = 256;

/// Aggregate status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Created,
    Decomposing,
    Ready,
    Running,
    Merging,
    Completed,
    Failed,
}

impl SessionStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Decomposing => "decomposing",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Merging => "merging",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Kind of a session event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEventKind {
    #[serde(rename = "session.created")]
    Created,
    #[serde(rename = "session.decomposed")]
    Decomposed,
    #[serde(rename = "session.executing")]
    Executing,
    #[serde(rename = "session.merged")]
    Merged,
    #[serde(rename = "session.error")]
    Error,
    #[serde(rename = "task.started")]
    TaskStarted,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.failed")]
    TaskFailed,
}

/// An event on a session's stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub session_id: String,
    pub kind: SessionEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// A complete task execution session.
pub struct Session {
    pub id: String,
    pub user_task: String,
    pub repo_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub dag: Arc<Dag>,
    status: RwLock<SessionStatus>,
    started_at: RwLock<Option<DateTime<Utc>>>,
    completed_at: RwLock<Option<DateTime<Utc>>>,
    runtime: Arc<dyn AgentRuntime>,
    provider: Arc<dyn WorkspaceProvider>,
    orchestrator: Orchestrator,
    merger: Merger,
    events: broadcast::Sender<SessionEvent>,
    max_parallel: usize,
    target_branch: String,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user_task", &self.user_task)
            .field("repo_path", &self.repo_path)
            .field("created_at", &self.created_at)
            .field("max_parallel", &self.max_parallel)
            .field("target_branch", &self.target_branch)
            .finish()
    }
}

impl Session {
    fn new(
        user_task: impl Into<String>,
        repo_path: PathBuf,
        runtime: Arc<dyn AgentRuntime>,
        provider: Arc<dyn WorkspaceProvider>,
        max_parallel: usize,
        target_branch: impl Into<String>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            id: format!("session-{}", Uuid::new_v4()),
            user_task: user_task.into(),
            repo_path,
            created_at: Utc::now(),
            dag: Arc::new(Dag::new()),
            status: RwLock::new(SessionStatus::Created),
            started_at: RwLock::new(None),
            completed_at: RwLock::new(None),
            orchestrator: Orchestrator::new(Arc::clone(&runtime)),
            merger: Merger::new(Arc::clone(&runtime), Arc::clone(&provider)),
            runtime,
            provider,
            events,
            max_parallel,
            target_branch: target_branch.into(),
        })
    }

    /// Current aggregate status.
    pub async fn status(&self) -> SessionStatus {
        *self.status.read().await
    }

    /// When work on the session started, if it has.
    pub async fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.read().await
    }

    /// When the session reached `completed`, if it has.
    pub async fn completed_at(&self) -> Option<DateTime<Utc>> {
        *self.completed_at.read().await
    }

    /// Subscribe to this session's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn set_status(&self, status: SessionStatus) {
        let mut guard = self.status.write().await;
        *guard = status;
    }

    fn emit(&self, kind: SessionEventKind, task_id: Option<String>, data: Option<String>) {
        let _ = self.events.send(SessionEvent {
            session_id: self.id.clone(),
            kind,
            task_id,
            data,
        });
    }

    async fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        error!(session = %self.id, "{message}");
        self.set_status(SessionStatus::Failed).await;
        self.emit(SessionEventKind::Error, None, Some(message));
    }

    async fn expect_status(&self, expected: SessionStatus) -> Result<(), SessionError> {
        let actual = self.status().await;
        if actual != expected {
            return Err(SessionError::InvalidState {
                expected: expected.as_str().to_string(),
                actual: actual.as_str().to_string(),
            });
        }
        Ok(())
    }

    /// Decompose the user task into the session's graph. Synchronous: on
    /// return the graph is fully populated, or the session has failed.
    pub async fn decompose(&self, cancel: &CancellationToken) -> Result<(), SessionError> {
        self.expect_status(SessionStatus::Created).await?;
        self.set_status(SessionStatus::Decomposing).await;
        {
            let mut started = self.started_at.write().await;
            *started = Some(Utc::now());
        }

        let decomposition = match self
            .orchestrator
            .decompose(&self.repo_path, &self.user_task, cancel)
            .await
        {
            Ok(decomposition) => decomposition,
            Err(err) => {
                self.fail(format!("decomposition failed: {err}")).await;
                return Err(SessionError::Decompose(err));
            }
        };

        for suggestion in decomposition.tasks {
            let task = Task::new(
                suggestion.id,
                suggestion.title,
                suggestion.description,
                suggestion.depends_on,
            );
            if let Err(err) = self.dag.add_task(task).await {
                self.fail(format!("invalid task graph: {err}")).await;
                return Err(err.into());
            }
        }

        self.set_status(SessionStatus::Ready).await;
        info!(session = %self.id, tasks = self.dag.len().await, "session decomposed");
        self.emit(
            SessionEventKind::Decomposed,
            None,
            Some(decomposition.description),
        );
        Ok(())
    }

    /// Execute the task graph to completion.
    pub async fn execute(&self, cancel: &CancellationToken) -> Result<(), SessionError> {
        self.expect_status(SessionStatus::Ready).await?;
        self.set_status(SessionStatus::Running).await;
        self.emit(SessionEventKind::Executing, None, None);

        let executor = Executor::new(
            Arc::clone(&self.dag),
            Arc::clone(&self.runtime),
            Arc::clone(&self.provider),
            self.max_parallel,
        );

        // Forward executor events onto the session stream as task.* kinds.
        if let Some(mut events) = executor.take_events().await {
            let session_id = self.id.clone();
            let sender = self.events.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    let kind = match event.kind {
                        ExecutionEventKind::Started => SessionEventKind::TaskStarted,
                        ExecutionEventKind::Completed => SessionEventKind::TaskCompleted,
                        ExecutionEventKind::Failed => SessionEventKind::TaskFailed,
                        ExecutionEventKind::Output => continue,
                    };
                    let _ = sender.send(SessionEvent {
                        session_id: session_id.clone(),
                        kind,
                        task_id: Some(event.task_id),
                        data: event.data,
                    });
                }
            });
        }

        if let Err(err) = executor.run(cancel).await {
            self.fail(format!("execution failed: {err}")).await;
            return Err(err.into());
        }

        self.set_status(SessionStatus::Merging).await;
        Ok(())
    }

    /// Merge the branches of completed tasks into the target branch.
    pub async fn merge(&self, cancel: &CancellationToken) -> Result<(), SessionError> {
        self.expect_status(SessionStatus::Merging).await?;

        // Dependency-respecting merge order: completed branches in
        // topological order.
        let ordered = match self.dag.topological_order().await {
            Ok(ordered) => ordered,
            Err(err) => {
                self.fail(format!("merge planning failed: {err}")).await;
                return Err(err.into());
            }
        };
        let branches: Vec<String> = ordered
            .into_iter()
            .filter(|t| t.status == TaskStatus::Completed && !t.branch_name.is_empty())
            .map(|t| t.branch_name)
            .collect();

        let plan = Merger::create_plan(branches, self.target_branch.as_str());
        let result = match self.merger.merge(&self.repo_path, &plan, cancel).await {
            Ok(result) => result,
            Err(err) => {
                self.fail(format!("merge failed: {err}")).await;
                return Err(err.into());
            }
        };

        if !result.success {
            let branches = result.failed_branches.clone();
            self.fail(format!(
                "merge failed for branches: {}",
                branches.join(", ")
            ))
            .await;
            return Err(SessionError::MergeFailed { branches });
        }

        self.set_status(SessionStatus::Completed).await;
        {
            let mut completed = self.completed_at.write().await;
            *completed = Some(Utc::now());
        }
        info!(
            session = %self.id,
            merged = result.merged_count,
            resolved_by_agent = result.resolved_by_agent.len(),
            "session merged"
        );
        self.emit(
            SessionEventKind::Merged,
            None,
            Some(result.merge_commit),
        );
        Ok(())
    }
}

/// Manages multiple sessions over shared collaborators.
pub struct SessionManager {
    sessions: RwLock<std::collections::HashMap<String, Arc<Session>>>,
    runtime: Arc<dyn AgentRuntime>,
    config: Config,
}

impl SessionManager {
    /// Create a manager spawning agents with the configured binary.
    pub fn new(config: Config) -> Self {
        let runtime: Arc<dyn AgentRuntime> = Arc::new(AgentManager::new(&config.agent_bin));
        Self::with_runtime(config, runtime)
    }

    /// Create a manager over an explicit agent runtime.
    pub fn with_runtime(config: Config, runtime: Arc<dyn AgentRuntime>) -> Self {
        Self {
            sessions: RwLock::new(std::collections::HashMap::new()),
            runtime,
            config,
        }
    }

    /// Create a session for a user task against the configured repository.
    pub async fn create(&self, user_task: impl Into<String>) -> Arc<Session> {
        let repo = self.config.repo_path.clone();
        self.create_with_path(user_task, repo).await
    }

    /// Create a session for a user task against a specific repository.
    pub async fn create_with_path(
        &self,
        user_task: impl Into<String>,
        repo_path: PathBuf,
    ) -> Arc<Session> {
        let provider: Arc<dyn WorkspaceProvider> =
            Arc::new(GitWorktreeProvider::new(&repo_path));
        let session = Session::new(
            user_task,
            repo_path,
            Arc::clone(&self.runtime),
            provider,
            self.config.max_parallel,
            self.config.base_branch.as_str(),
        );

        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(session.id.clone(), Arc::clone(&session));
        }
        info!(session = %session.id, "session created");
        session.emit(SessionEventKind::Created, None, None);
        session
    }

    /// Retrieve a session by ID.
    pub async fn get(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        let sessions = self.sessions.read().await;
        sessions
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// All sessions, in unspecified order.
    pub async fn list_all(&self) -> Vec<Arc<Session>> {
        let sessions = self.sessions.read().await;
        sessions.values().cloned().collect()
    }
}
