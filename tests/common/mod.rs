// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Scripted agent runtime and workspace provider for scenario tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use codecrew::agent::{AgentConfig, AgentRuntime};
use codecrew::error::AgentError;
use codecrew::workspace::{WorkspaceError, WorkspaceProvider, Worktree};

/// Shared chronological log of runtime and provider operations.
pub type OpLog = Arc<Mutex<Vec<String>>>;

pub fn new_op_log() -> OpLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Index of the first log entry containing `needle`.
pub fn log_index(log: &OpLog, needle: &str) -> Option<usize> {
    log.lock().unwrap().iter().position(|op| op.contains(needle))
}

#[derive(Default)]
struct RuntimeState {
    spawned: Vec<String>,
    sent: Vec<(String, String)>,
    stopped: Vec<String>,
    /// Outputs by agent-ID prefix; consumed per `output()` call in order.
    outputs: Vec<(String, String)>,
    /// Agent-ID prefixes whose turns fail.
    failing: Vec<String>,
}

/// An agent runtime that completes turns after a short scripted delay.
pub struct MockRuntime {
    log: OpLog,
    state: Mutex<RuntimeState>,
    turn_delay: Duration,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl MockRuntime {
    pub fn new(log: OpLog) -> Self {
        Self {
            log,
            state: Mutex::new(RuntimeState::default()),
            turn_delay: Duration::from_millis(25),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }

    /// Script the output returned for agents whose ID starts with `prefix`.
    pub fn script_output(&self, prefix: &str, output: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .outputs
            .push((prefix.to_string(), output.to_string()));
    }

    /// Make turns fail for agents whose ID starts with `prefix`.
    pub fn fail_agent(&self, prefix: &str) {
        let mut state = self.state.lock().unwrap();
        state.failing.push(prefix.to_string());
    }

    pub fn spawned(&self) -> Vec<String> {
        self.state.lock().unwrap().spawned.clone()
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.state.lock().unwrap().stopped.clone()
    }

    /// Highest number of concurrently running turns observed.
    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn push_log(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl AgentRuntime for MockRuntime {
    async fn spawn_agent(
        &self,
        config: AgentConfig,
        _cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        self.push_log(format!("spawn:{}", config.id));
        let mut state = self.state.lock().unwrap();
        if state.spawned.contains(&config.id) {
            return Err(AgentError::AlreadyExists(config.id));
        }
        state.spawned.push(config.id);
        Ok(())
    }

    async fn send_task(
        &self,
        agent_id: &str,
        message: &str,
        _cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        self.push_log(format!("send:{agent_id}"));
        let mut state = self.state.lock().unwrap();
        state.sent.push((agent_id.to_string(), message.to_string()));
        Ok(())
    }

    async fn wait_for_completion(
        &self,
        agent_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        self.push_log(format!("wait:{agent_id}"));

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        let outcome = tokio::select! {
            _ = tokio::time::sleep(self.turn_delay) => {
                let state = self.state.lock().unwrap();
                if state.failing.iter().any(|p| agent_id.starts_with(p.as_str())) {
                    Err(AgentError::TurnFailed("scripted failure".to_string()))
                } else {
                    Ok(())
                }
            }
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    async fn stop_agent(&self, agent_id: &str) -> Result<(), AgentError> {
        self.push_log(format!("stop:{agent_id}"));
        let mut state = self.state.lock().unwrap();
        state.stopped.push(agent_id.to_string());
        Ok(())
    }

    async fn output(&self, agent_id: &str) -> String {
        let state = self.state.lock().unwrap();
        state
            .outputs
            .iter()
            .find(|(prefix, _)| agent_id.starts_with(prefix.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_default()
    }
}

#[derive(Default)]
struct ProviderState {
    /// Branches whose merge conflicts.
    conflict_branches: Vec<String>,
    /// Branches whose merge fails without conflicts.
    broken_branches: Vec<String>,
    conflict_files: Vec<String>,
    /// Whether the last merge attempt hit a conflict.
    last_merge_conflicted: bool,
    octopus_fails: bool,
    commit_counter: usize,
    created: Vec<String>,
    removed: Vec<String>,
    aborted: usize,
}

/// A workspace provider over an in-memory repository model.
pub struct MockProvider {
    log: OpLog,
    state: Mutex<ProviderState>,
}

impl MockProvider {
    pub fn new(log: OpLog) -> Self {
        Self {
            log,
            state: Mutex::new(ProviderState::default()),
        }
    }

    /// Make merges of `branch` conflict on the given files.
    pub fn conflict_on(&self, branch: &str, files: &[&str]) {
        let mut state = self.state.lock().unwrap();
        state.conflict_branches.push(branch.to_string());
        state.conflict_files = files.iter().map(|f| f.to_string()).collect();
    }

    /// Make merges of `branch` fail without conflicts.
    pub fn break_branch(&self, branch: &str) {
        let mut state = self.state.lock().unwrap();
        state.broken_branches.push(branch.to_string());
    }

    /// Make the n-way merge fail.
    pub fn fail_octopus(&self) {
        let mut state = self.state.lock().unwrap();
        state.octopus_fails = true;
    }

    pub fn created_branches(&self) -> Vec<String> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn removed_paths(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }

    pub fn aborted_merges(&self) -> usize {
        self.state.lock().unwrap().aborted
    }

    fn push_log(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl WorkspaceProvider for MockProvider {
    async fn create(
        &self,
        branch: &str,
        _base_rev: Option<&str>,
    ) -> Result<Worktree, WorkspaceError> {
        self.push_log(format!("create:{branch}"));
        let mut state = self.state.lock().unwrap();
        state.created.push(branch.to_string());
        Ok(Worktree {
            path: PathBuf::from(format!("/mock/worktrees/{branch}")),
            branch: branch.to_string(),
            commit: "base-commit".to_string(),
        })
    }

    async fn merge(
        &self,
        workspace: &Path,
        source_branch: &str,
    ) -> Result<String, WorkspaceError> {
        self.push_log(format!(
            "merge:{}:{source_branch}",
            workspace.display()
        ));
        let mut state = self.state.lock().unwrap();
        if state.conflict_branches.iter().any(|b| b == source_branch) {
            state.last_merge_conflicted = true;
            return Err(WorkspaceError::MergeFailed {
                branch: source_branch.to_string(),
                output: "CONFLICT (content): merge conflict".to_string(),
            });
        }
        if state.broken_branches.iter().any(|b| b == source_branch) {
            state.last_merge_conflicted = false;
            return Err(WorkspaceError::MergeFailed {
                branch: source_branch.to_string(),
                output: "fatal: refusing to merge unrelated histories".to_string(),
            });
        }
        state.last_merge_conflicted = false;
        state.commit_counter += 1;
        Ok(format!("merge-{}", state.commit_counter))
    }

    async fn octopus_merge(
        &self,
        workspace: &Path,
        branches: &[String],
    ) -> Result<String, WorkspaceError> {
        self.push_log(format!(
            "octopus:{}:{}",
            workspace.display(),
            branches.join(",")
        ));
        let mut state = self.state.lock().unwrap();
        if state.octopus_fails {
            state.last_merge_conflicted = true;
            return Err(WorkspaceError::MergeFailed {
                branch: branches.join(", "),
                output: "CONFLICT (content): merge conflict".to_string(),
            });
        }
        state.commit_counter += 1;
        Ok(format!("octopus-{}", state.commit_counter))
    }

    async fn has_conflicts(
        &self,
        _workspace: &Path,
    ) -> Result<(bool, Vec<String>), WorkspaceError> {
        let state = self.state.lock().unwrap();
        if state.last_merge_conflicted {
            Ok((true, state.conflict_files.clone()))
        } else {
            Ok((false, Vec::new()))
        }
    }

    async fn abort_merge(&self, workspace: &Path) -> Result<(), WorkspaceError> {
        self.push_log(format!("abort:{}", workspace.display()));
        let mut state = self.state.lock().unwrap();
        state.aborted += 1;
        state.last_merge_conflicted = false;
        Ok(())
    }

    async fn checkout(&self, workspace: &Path, branch: &str) -> Result<(), WorkspaceError> {
        self.push_log(format!("checkout:{}:{branch}", workspace.display()));
        Ok(())
    }

    async fn commit_changes(
        &self,
        workspace: &Path,
        _message: &str,
    ) -> Result<Option<String>, WorkspaceError> {
        self.push_log(format!("commit:{}", workspace.display()));
        let mut state = self.state.lock().unwrap();
        state.commit_counter += 1;
        Ok(Some(format!("commit-{}", state.commit_counter)))
    }

    async fn remove(&self, path: &Path) -> Result<(), WorkspaceError> {
        self.push_log(format!("remove:{}", path.display()));
        let mut state = self.state.lock().unwrap();
        state.removed.push(path.display().to_string());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Worktree>, WorkspaceError> {
        Ok(Vec::new())
    }
}
