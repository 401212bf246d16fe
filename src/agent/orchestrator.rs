// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Task decomposition.
//!
//! One read-only agent is pointed at the repository root, asked to break the
//! user's task into parallelizable sub-tasks, and its reply is decoded into
//! task suggestions. Undecodable output fails the whole decomposition; no
//! partial graph is ever produced.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::types::{AgentConfig, AgentRole};
use super::AgentRuntime;
use crate::error::AgentError;

/// Result of task decomposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDecomposition {
    #[serde(default)]
    pub description: String,
    pub tasks: Vec<TaskSuggestion>,
    #[serde(default)]
    pub total_estimated_time: String,
}

/// A single suggested task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSuggestion {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub estimated_time: String,
}

/// Decomposes user tasks via a read-only agent.
pub struct Orchestrator {
    runtime: Arc<dyn AgentRuntime>,
}

impl Orchestrator {
    pub fn new(runtime: Arc<dyn AgentRuntime>) -> Self {
        Self { runtime }
    }

    /// Analyse the repository and decompose the user's task.
    pub async fn decompose(
        &self,
        repo_path: &Path,
        user_task: &str,
        cancel: &CancellationToken,
    ) -> Result<TaskDecomposition, AgentError> {
        let agent_id = format!("orchestrator-{}", Uuid::new_v4());
        let config = AgentConfig::new(agent_id.as_str(), AgentRole::Orchestrator, repo_path)
            .with_base_instructions(analysis_instructions());

        self.runtime.spawn_agent(config, cancel).await?;

        let result = self.run_decomposition(&agent_id, user_task, cancel).await;
        if let Err(err) = self.runtime.stop_agent(&agent_id).await {
            debug!("failed to stop orchestrator agent: {err}");
        }
        result
    }

    async fn run_decomposition(
        &self,
        agent_id: &str,
        user_task: &str,
        cancel: &CancellationToken,
    ) -> Result<TaskDecomposition, AgentError> {
        let prompt = decomposition_prompt(user_task);
        self.runtime.send_task(agent_id, &prompt, cancel).await?;
        self.runtime.wait_for_completion(agent_id, cancel).await?;

        let output = self.runtime.output(agent_id).await;
        let decomposition = parse_decomposition(&output)?;
        info!(
            tasks = decomposition.tasks.len(),
            "decomposed user task into sub-tasks"
        );
        Ok(decomposition)
    }
}

/// Extract the JSON payload from the agent's output, unwrapping fenced code
/// blocks if present, and decode it.
pub fn parse_decomposition(output: &str) -> Result<TaskDecomposition, AgentError> {
    let json = extract_json(output);
    serde_json::from_str(json.trim()).map_err(|e| AgentError::InvalidOutput(e.to_string()))
}

fn extract_json(output: &str) -> &str {
    if let Some(start) = output.find("```json") {
        let rest = &output[start + "```json".len()..];
        if let Some(end) = rest.find("```") {
            return &rest[..end];
        }
    }
    if let Some(start) = output.find("```") {
        let rest = &output[start + "```".len()..];
        if let Some(end) = rest.find("```") {
            return &rest[..end];
        }
    }
    output
}

fn analysis_instructions() -> &'static str {
    "You are a task orchestrator. Your job is to:\n\
     1. Analyze the codebase structure\n\
     2. Understand the user's requirements\n\
     3. Break down complex tasks into smaller, parallelizable sub-tasks\n\
     4. Output results as JSON in the specified format\n\
     \n\
     Always respond with valid JSON, no markdown formatting."
}

fn decomposition_prompt(user_task: &str) -> String {
    format!(
        r#"Analyze this codebase and decompose the following task into sub-tasks.

User Task: {user_task}

Please analyze:
1. The current codebase structure
2. Which parts can be done in parallel
3. Which parts have dependencies

Output your analysis as a JSON object with this format:
{{
  "description": "Overall approach description",
  "tasks": [
    {{
      "id": "task-1",
      "title": "Brief title",
      "description": "What to do",
      "dependsOn": [],
      "files": ["path/to/file1.rs", "path/to/file2.rs"],
      "estimatedTime": "5-10 min"
    }}
  ],
  "totalEstimatedTime": "20-30 min"
}}

Respond ONLY with valid JSON, no markdown, no explanation."#
    )
}
