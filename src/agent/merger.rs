// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Merge planner and driver.
//!
//! Folds completed task branches back into the target branch. Clean merges
//! are plain no-fast-forward merges; a conflicted merge is handed to a merger
//! agent that edits the conflicted files in place and reports `DONE` or
//! `FAILED:<reason>`. The octopus strategy tries an n-way merge first and
//! falls back to sequential on any failure.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{AgentConfig, AgentRole};
use super::AgentRuntime;
use crate::error::MergeError;
use crate::workspace::WorkspaceProvider;

/// Branch count above which an auto plan prefers the octopus strategy.
const OCTOPUS_THRESHOLD: usize = 3;

/// How merges are ordered and attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// One branch at a time, agent-assisted on conflict.
    Sequential,
    /// All branches in one n-way merge, falling back to sequential.
    Octopus,
    /// Resolved to one of the above when the plan is built.
    Auto,
}

/// The order and strategy for merging completed branches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergePlan {
    pub branches: Vec<String>,
    pub strategy: MergeStrategy,
    pub target_branch: String,
}

/// Outcome of executing a merge plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResult {
    pub success: bool,
    pub merged_count: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_branches: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolved_by_agent: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub merge_commit: String,
}

impl MergeResult {
    fn record_merge(&mut self, commit: String) {
        self.merged_count += 1;
        if self.merge_commit.is_empty() {
            self.merge_commit = commit;
        }
    }
}

/// Merges completed task branches, using an agent for conflict resolution.
pub struct Merger {
    runtime: Arc<dyn AgentRuntime>,
    provider: Arc<dyn WorkspaceProvider>,
}

impl Merger {
    pub fn new(runtime: Arc<dyn AgentRuntime>, provider: Arc<dyn WorkspaceProvider>) -> Self {
        Self { runtime, provider }
    }

    /// Build a plan from completed task branches. Few branches merge
    /// sequentially; many go through the octopus path first.
    pub fn create_plan(branches: Vec<String>, target_branch: impl Into<String>) -> MergePlan {
        let strategy = if branches.len() > OCTOPUS_THRESHOLD {
            MergeStrategy::Octopus
        } else {
            MergeStrategy::Sequential
        };
        MergePlan {
            branches,
            strategy,
            target_branch: target_branch.into(),
        }
    }

    /// Execute a merge plan against the repository at `repo_path`.
    pub async fn merge(
        &self,
        repo_path: &Path,
        plan: &MergePlan,
        cancel: &CancellationToken,
    ) -> Result<MergeResult, MergeError> {
        match plan.strategy {
            MergeStrategy::Sequential | MergeStrategy::Auto => {
                self.merge_sequential(repo_path, plan, cancel).await
            }
            MergeStrategy::Octopus => self.merge_octopus(repo_path, plan, cancel).await,
        }
    }

    /// Merge branches one by one, spawning a single merger agent for the
    /// whole pass and asking it to resolve conflicts as they arise.
    async fn merge_sequential(
        &self,
        repo_path: &Path,
        plan: &MergePlan,
        cancel: &CancellationToken,
    ) -> Result<MergeResult, MergeError> {
        self.provider
            .checkout(repo_path, &plan.target_branch)
            .await?;

        let agent_id = format!("merger-{}", Uuid::new_v4());
        let config = AgentConfig::new(agent_id.as_str(), AgentRole::Merger, repo_path)
            .with_base_instructions(merge_instructions(plan));
        self.runtime.spawn_agent(config, cancel).await?;

        let mut result = MergeResult {
            success: true,
            ..Default::default()
        };

        for branch in &plan.branches {
            match self.provider.merge(repo_path, branch).await {
                Ok(commit) => {
                    debug!(branch, commit, "merged cleanly");
                    result.record_merge(commit);
                    continue;
                }
                Err(err) => {
                    debug!(branch, "merge failed: {err}");
                }
            }

            let (conflicted, files) = match self.provider.has_conflicts(repo_path).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(branch, "could not inspect conflicts: {err}");
                    result.failed_branches.push(branch.clone());
                    result.success = false;
                    let _ = self.provider.abort_merge(repo_path).await;
                    continue;
                }
            };

            if !conflicted {
                // Failed for some other reason (e.g. unrelated histories).
                result.failed_branches.push(branch.clone());
                result.success = false;
                continue;
            }

            match self
                .resolve_conflicts(&agent_id, &files, cancel)
                .await
            {
                Ok(true) => {
                    let message = format!("Merge {branch} (conflicts resolved by agent)");
                    match self.provider.commit_changes(repo_path, &message).await {
                        Ok(Some(commit)) => {
                            info!(branch, "conflicts resolved by agent");
                            result.record_merge(commit);
                            result.resolved_by_agent.push(branch.clone());
                        }
                        Ok(None) | Err(_) => {
                            result.failed_branches.push(branch.clone());
                            result.success = false;
                            let _ = self.provider.abort_merge(repo_path).await;
                        }
                    }
                }
                Ok(false) | Err(_) => {
                    result.failed_branches.push(branch.clone());
                    result.conflicts.extend(files);
                    result.success = false;
                    let _ = self.provider.abort_merge(repo_path).await;
                }
            }
        }

        if let Err(err) = self.runtime.stop_agent(&agent_id).await {
            debug!("failed to stop merger agent: {err}");
        }

        Ok(result)
    }

    /// Attempt one n-way merge; fall back to sequential on any failure.
    async fn merge_octopus(
        &self,
        repo_path: &Path,
        plan: &MergePlan,
        cancel: &CancellationToken,
    ) -> Result<MergeResult, MergeError> {
        self.provider
            .checkout(repo_path, &plan.target_branch)
            .await?;

        match self
            .provider
            .octopus_merge(repo_path, &plan.branches)
            .await
        {
            Ok(commit) => {
                info!(branches = plan.branches.len(), "octopus merge succeeded");
                return Ok(MergeResult {
                    success: true,
                    merged_count: plan.branches.len(),
                    merge_commit: commit,
                    ..Default::default()
                });
            }
            Err(err) => {
                debug!("octopus merge failed, falling back to sequential: {err}");
            }
        }

        let _ = self.provider.abort_merge(repo_path).await;
        self.merge_sequential(repo_path, plan, cancel).await
    }

    /// Ask the merger agent to resolve the given conflicts. Returns whether
    /// the agent reported success.
    async fn resolve_conflicts(
        &self,
        agent_id: &str,
        conflict_files: &[String],
        cancel: &CancellationToken,
    ) -> Result<bool, MergeError> {
        if conflict_files.is_empty() {
            return Ok(false);
        }

        let prompt = conflict_prompt(conflict_files);
        self.runtime.send_task(agent_id, &prompt, cancel).await.map_err(MergeError::Agent)?;
        self.runtime
            .wait_for_completion(agent_id, cancel)
            .await
            .map_err(MergeError::Agent)?;

        let output = self.runtime.output(agent_id).await;
        Ok(output.contains("DONE"))
    }
}

fn merge_instructions(plan: &MergePlan) -> String {
    format!(
        "You are a merge assistant. Your job is to help merge branches into {target}.\n\
         \n\
         When conflicts occur:\n\
         1. Analyze both sides carefully\n\
         2. Prefer the version that preserves functionality\n\
         3. If both changes are valid but incompatible, keep both with conditional logic\n\
         4. Never delete code without clear reason\n\
         5. Add comments explaining merge decisions\n\
         \n\
         Merge strategy: {strategy:?}\n\
         \n\
         You will be asked to resolve conflicts as they arise. Focus on creating a clean, functional merge.",
        target = plan.target_branch,
        strategy = plan.strategy,
    )
}

fn conflict_prompt(conflict_files: &[String]) -> String {
    format!(
        "Please resolve the merge conflicts in the following files:\n\
         {files}\n\
         \n\
         For each conflict:\n\
         1. Open the file and examine both sides\n\
         2. Understand the intent of both changes\n\
         3. Create a merged version that preserves functionality from both sides\n\
         4. Use git add to mark each file as resolved\n\
         \n\
         After resolving all conflicts, report \"DONE\". If you cannot resolve a conflict, report \"FAILED: <reason>\".",
        files = conflict_files.join("\n"),
    )
}
