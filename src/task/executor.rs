// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Parallel DAG executor.
//!
//! Drives a task graph to a terminal state: ready tasks are paired with a
//! freshly spawned worker agent and an isolated workspace, bounded by a
//! counting semaphore. A single task failure flips the graph's failed flag;
//! the main loop observes it and cancels the scope, aborting every other
//! in-flight task body.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::dag::Dag;
use super::types::{Task, TaskStatus};
use crate::agent::types::{AgentConfig, AgentRole};
use crate::agent::AgentRuntime;
use crate::error::ExecutorError;
use crate::rpc::SandboxMode;
use crate::workspace::WorkspaceProvider;

/// Capacity of the executor's event channel. The producer blocks when the
/// channel is full, so slow consumers exert back-pressure without reordering.
const EVENT_CAPACITY: usize = 256;

/// Scheduling latency bound for the ready-task poll.
const TICK: Duration = Duration::from_millis(100);

/// Kind of an execution event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionEventKind {
    Started,
    Completed,
    Failed,
    Output,
}

/// An event observed during task execution. Events for a single task arrive
/// in order `started`, any `output`, then `completed` or `failed`; across
/// tasks no ordering is guaranteed.
#[derive(Debug, Clone)]
pub struct ExecutionEvent {
    pub task_id: String,
    pub kind: ExecutionEventKind,
    pub data: Option<String>,
}

impl ExecutionEvent {
    fn new(task_id: &str, kind: ExecutionEventKind, data: Option<String>) -> Self {
        Self {
            task_id: task_id.to_string(),
            kind,
            data,
        }
    }
}

/// Executes a DAG of tasks using worker agents in isolated workspaces.
pub struct Executor {
    dag: Arc<Dag>,
    runtime: Arc<dyn AgentRuntime>,
    provider: Arc<dyn WorkspaceProvider>,
    max_parallel: usize,
    event_tx: mpsc::Sender<ExecutionEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<ExecutionEvent>>>,
}

impl Executor {
    /// Create an executor with a parallelism bound of at least one.
    pub fn new(
        dag: Arc<Dag>,
        runtime: Arc<dyn AgentRuntime>,
        provider: Arc<dyn WorkspaceProvider>,
        max_parallel: usize,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        Self {
            dag,
            runtime,
            provider,
            max_parallel: max_parallel.max(1),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    /// Take the event receiver. Returns `None` if already taken.
    pub async fn take_events(&self) -> Option<mpsc::Receiver<ExecutionEvent>> {
        self.event_rx.lock().await.take()
    }

    /// Run the DAG until every task is terminal.
    ///
    /// Refuses to start on a cyclic graph. Returns
    /// [`ExecutorError::TasksFailed`] if any task failed.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), ExecutorError> {
        if self.dag.has_cycle().await {
            return Err(ExecutorError::CycleDetected);
        }

        let scope = cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        let mut externally_cancelled = false;

        loop {
            if scope.is_cancelled() {
                externally_cancelled = true;
                break;
            }
            if self.dag.all_completed().await {
                break;
            }
            if self.dag.has_failed().await {
                scope.cancel();
                break;
            }

            let ready = self.dag.ready_tasks().await;
            if ready.is_empty() {
                // Nothing ready and nothing running means some dependency can
                // never be satisfied (e.g. an unknown dependency ID). Fail
                // those tasks instead of ticking forever.
                let tasks = self.dag.tasks().await;
                let stalled = tasks.iter().all(|t| t.status != TaskStatus::Running)
                    && !tasks.iter().all(|t| t.status.is_terminal());
                if stalled {
                    for task in &tasks {
                        if !task.status.is_terminal() {
                            warn!(task = %task.id, "dependencies can never be satisfied");
                            self.dag
                                .set_task_failed(&task.id, "unsatisfiable dependencies")
                                .await;
                        }
                    }
                    continue;
                }

                tokio::select! {
                    _ = scope.cancelled() => {
                        externally_cancelled = true;
                        break;
                    }
                    _ = tokio::time::sleep(TICK) => continue,
                }
            }

            for task in ready {
                // The permit is taken before the task turns `running`, so the
                // number of running tasks never exceeds the bound.
                let permit = match Arc::clone(&semaphore).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                self.dag.set_task_started(&task.id).await;

                let dag = Arc::clone(&self.dag);
                let runtime = Arc::clone(&self.runtime);
                let provider = Arc::clone(&self.provider);
                let events = self.event_tx.clone();
                let scope = scope.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    let outcome = Self::execute_task(
                        &dag, &runtime, &provider, &events, &task, &scope,
                    )
                    .await;
                    match outcome {
                        Ok(()) => {
                            dag.set_task_completed(&task.id).await;
                            let _ = events
                                .send(ExecutionEvent::new(
                                    &task.id,
                                    ExecutionEventKind::Completed,
                                    None,
                                ))
                                .await;
                        }
                        Err(err) if err.is_cancelled() => {
                            dag.update_status(&task.id, TaskStatus::Cancelled).await;
                            let _ = events
                                .send(ExecutionEvent::new(
                                    &task.id,
                                    ExecutionEventKind::Failed,
                                    Some("cancelled".to_string()),
                                ))
                                .await;
                        }
                        Err(err) => {
                            dag.set_task_failed(&task.id, err.to_string()).await;
                            let _ = events
                                .send(ExecutionEvent::new(
                                    &task.id,
                                    ExecutionEventKind::Failed,
                                    Some(err.to_string()),
                                ))
                                .await;
                        }
                    }
                }));
            }
        }

        for handle in handles {
            let _ = handle.await;
        }

        // Anything never dispatched (dependents of a failed task, or work cut
        // short by cancellation) ends terminal.
        for task in self.dag.tasks().await {
            if !task.status.is_terminal() {
                self.dag.update_status(&task.id, TaskStatus::Cancelled).await;
            }
        }

        if self.dag.has_failed().await {
            return Err(ExecutorError::TasksFailed);
        }
        if externally_cancelled {
            return Err(ExecutorError::Cancelled);
        }
        info!("task graph completed");
        Ok(())
    }

    /// Run a single task: workspace, dependency merges, worker agent, commit.
    async fn execute_task(
        dag: &Arc<Dag>,
        runtime: &Arc<dyn AgentRuntime>,
        provider: &Arc<dyn WorkspaceProvider>,
        events: &mpsc::Sender<ExecutionEvent>,
        task: &Task,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutorError> {
        let _ = events
            .send(ExecutionEvent::new(
                &task.id,
                ExecutionEventKind::Started,
                None,
            ))
            .await;

        let branch = if task.branch_name.is_empty() {
            format!("task-{}", task.id)
        } else {
            task.branch_name.clone()
        };
        dag.set_task_branch(&task.id, &branch).await;

        let worktree = provider.create(&branch, None).await?;
        let workspace = worktree.path.clone();
        let workspace_str = workspace.to_string_lossy().to_string();
        dag.set_task_workspace(&task.id, &workspace_str, &worktree.commit)
            .await;

        for dep_branch in dag.get_dependency_branches(&task.id).await {
            match provider.merge(&workspace, &dep_branch).await {
                Ok(commit) => {
                    if !commit.is_empty() {
                        dag.add_merged_commit(&task.id, &commit).await;
                    }
                }
                Err(err) => {
                    let _ = provider.abort_merge(&workspace).await;
                    let _ = provider.remove(&workspace).await;
                    return Err(ExecutorError::DependencyMerge {
                        branch: dep_branch,
                        message: err.to_string(),
                    });
                }
            }
        }

        let agent_id = format!("agent-{}", task.id);
        let config = AgentConfig::new(agent_id.as_str(), AgentRole::Worker, &workspace)
            .with_sandbox(SandboxMode::WorkspaceWrite);
        if let Err(err) = runtime.spawn_agent(config, cancel).await {
            let _ = provider.remove(&workspace).await;
            return Err(err.into());
        }
        dag.set_task_agent(&task.id, &agent_id).await;

        if let Err(err) = runtime.send_task(&agent_id, &task.description, cancel).await {
            Self::cleanup(runtime, provider, &agent_id, &workspace).await;
            return Err(err.into());
        }

        if let Err(err) = runtime.wait_for_completion(&agent_id, cancel).await {
            Self::cleanup(runtime, provider, &agent_id, &workspace).await;
            return Err(err.into());
        }

        // Surface the agent's text before the terminal event.
        let agent_output = runtime.output(&agent_id).await;
        let lines: Vec<String> = agent_output
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.to_string())
            .collect();
        if !lines.is_empty() {
            dag.append_task_output(&task.id, lines.clone()).await;
            for line in lines {
                let _ = events
                    .send(ExecutionEvent::new(
                        &task.id,
                        ExecutionEventKind::Output,
                        Some(line),
                    ))
                    .await;
            }
        }

        let message = format!("Task {}: {}", task.id, task.title);
        match provider.commit_changes(&workspace, &message).await {
            // An empty diff is a legitimate no-op success.
            Ok(None) => debug!(task = %task.id, "agent made no changes"),
            Ok(Some(commit)) => {
                dag.update_task_result(&task.id, &commit).await;
            }
            Err(err) => {
                Self::cleanup(runtime, provider, &agent_id, &workspace).await;
                return Err(err.into());
            }
        }

        // The workspace is retained for the merge phase; only the agent goes.
        if let Err(err) = runtime.stop_agent(&agent_id).await {
            warn!(task = %task.id, "failed to stop agent: {err}");
        }

        Ok(())
    }

    /// Stop the agent and remove the workspace after a failure.
    async fn cleanup(
        runtime: &Arc<dyn AgentRuntime>,
        provider: &Arc<dyn WorkspaceProvider>,
        agent_id: &str,
        workspace: &std::path::Path,
    ) {
        let _ = runtime.stop_agent(agent_id).await;
        let _ = provider.remove(workspace).await;
    }
}
