// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Isolated version-control workspaces.
//!
//! The executor and merge driver consume workspaces through the
//! [`WorkspaceProvider`] trait: an isolated checkout per branch, merges into a
//! checkout, commits, conflict inspection, and cleanup. The concrete backend
//! is [`git::GitWorktreeProvider`], built on `git worktree`.

pub mod git;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use git::GitWorktreeProvider;

/// Error type for workspace operations.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("git {command} failed: {output}")]
    Git { command: String, output: String },

    #[error("merge of {branch} failed: {output}")]
    MergeFailed { branch: String, output: String },

    #[error("invalid workspace: {0}")]
    InvalidWorkspace(String),
}

/// An isolated checkout at a named branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worktree {
    /// Path to the checkout.
    pub path: PathBuf,
    /// Branch checked out there.
    pub branch: String,
    /// Revision the checkout currently points at.
    pub commit: String,
}

/// Abstract provider of isolated version-control checkouts.
#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    /// Create an isolated checkout at a new branch rooted at `base_rev`
    /// (HEAD if `None`).
    async fn create(
        &self,
        branch: &str,
        base_rev: Option<&str>,
    ) -> Result<Worktree, WorkspaceError>;

    /// Merge `source_branch` into the checkout with no fast-forward.
    /// Returns the merge commit. On conflict the merge is left in progress
    /// so the caller can inspect and resolve it.
    async fn merge(
        &self,
        workspace: &Path,
        source_branch: &str,
    ) -> Result<String, WorkspaceError>;

    /// Merge every branch at once (n-way). Returns the single merge commit.
    async fn octopus_merge(
        &self,
        workspace: &Path,
        branches: &[String],
    ) -> Result<String, WorkspaceError>;

    /// Check whether the checkout has unresolved conflicts, returning the
    /// conflicted paths.
    async fn has_conflicts(
        &self,
        workspace: &Path,
    ) -> Result<(bool, Vec<String>), WorkspaceError>;

    /// Abort an in-progress merge.
    async fn abort_merge(&self, workspace: &Path) -> Result<(), WorkspaceError>;

    /// Check out an existing branch in the workspace.
    async fn checkout(&self, workspace: &Path, branch: &str) -> Result<(), WorkspaceError>;

    /// Stage and commit every pending change. Returns the commit revision,
    /// or `None` when there is nothing to commit.
    async fn commit_changes(
        &self,
        workspace: &Path,
        message: &str,
    ) -> Result<Option<String>, WorkspaceError>;

    /// Remove a checkout.
    async fn remove(&self, path: &Path) -> Result<(), WorkspaceError>;

    /// List all checkouts of the underlying repository.
    async fn list(&self) -> Result<Vec<Worktree>, WorkspaceError>;
}
