// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Task definitions for the dependency graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Check if this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A single task in the dependency graph.
///
/// Execution artefacts (`agent_id`, `workspace_path`, commits) are filled in
/// by the executor as the task progresses; an empty string means "not
/// assigned yet". `result_commit` stays empty on a no-op success where the
/// agent changed nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workspace_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub branch_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_commit: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub result_commit: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged_commits: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default)]
    pub output: Vec<String>,
}

impl Task {
    /// Create a new pending task.
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        depends_on: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            depends_on,
            agent_id: String::new(),
            workspace_path: String::new(),
            branch_name: String::new(),
            base_commit: String::new(),
            result_commit: String::new(),
            merged_commits: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: String::new(),
            output: Vec::new(),
        }
    }
}
