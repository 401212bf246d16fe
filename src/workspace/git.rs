// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Git worktree workspace provider.
//!
//! Checkouts live under `<repo>/.worktrees/<branch>` so later tasks can merge
//! by branch name. Branches are created with `git worktree add -b`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{WorkspaceError, WorkspaceProvider, Worktree};

/// Directory under the repository root that holds task worktrees.
const WORKTREE_DIR: &str = ".worktrees";

/// Workspace provider backed by `git worktree`.
pub struct GitWorktreeProvider {
    repo_path: PathBuf,
}

impl GitWorktreeProvider {
    /// Create a provider for the repository at `repo_path`.
    pub fn new(repo_path: impl AsRef<Path>) -> Self {
        Self {
            repo_path: repo_path.as_ref().to_path_buf(),
        }
    }

    /// The repository root this provider operates on.
    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// The checkout path used for a branch.
    pub fn worktree_path(&self, branch: &str) -> PathBuf {
        self.repo_path.join(WORKTREE_DIR).join(branch)
    }

    /// Run a git command in `cwd` and return its trimmed stdout.
    async fn git(&self, cwd: &Path, args: &[&str]) -> Result<String, WorkspaceError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let mut combined = String::from_utf8_lossy(&output.stderr).to_string();
            combined.push_str(&String::from_utf8_lossy(&output.stdout));
            Err(WorkspaceError::Git {
                command: args.join(" "),
                output: combined.trim().to_string(),
            })
        }
    }

    async fn head_commit(&self, cwd: &Path) -> Result<String, WorkspaceError> {
        self.git(cwd, &["rev-parse", "HEAD"]).await
    }
}

#[async_trait]
impl WorkspaceProvider for GitWorktreeProvider {
    async fn create(
        &self,
        branch: &str,
        base_rev: Option<&str>,
    ) -> Result<Worktree, WorkspaceError> {
        let base = match base_rev {
            Some(rev) if !rev.is_empty() => rev,
            _ => "HEAD",
        };
        let path = self.worktree_path(branch);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let path_str = path.to_string_lossy().to_string();
        info!(branch, path = %path_str, "creating worktree");
        self.git(
            &self.repo_path,
            &["worktree", "add", "-b", branch, &path_str, base],
        )
        .await?;

        let commit = self.head_commit(&path).await?;
        Ok(Worktree {
            path,
            branch: branch.to_string(),
            commit,
        })
    }

    async fn merge(
        &self,
        workspace: &Path,
        source_branch: &str,
    ) -> Result<String, WorkspaceError> {
        let message = format!("Merge {source_branch}");
        let result = self
            .git(
                workspace,
                &["merge", "--no-ff", "-m", &message, source_branch],
            )
            .await;

        match result {
            Ok(_) => self.head_commit(workspace).await,
            // The merge is left in progress so the caller can inspect
            // conflicts and hand the tree to an agent.
            Err(WorkspaceError::Git { output, .. }) => Err(WorkspaceError::MergeFailed {
                branch: source_branch.to_string(),
                output,
            }),
            Err(err) => Err(err),
        }
    }

    async fn octopus_merge(
        &self,
        workspace: &Path,
        branches: &[String],
    ) -> Result<String, WorkspaceError> {
        let message = format!("Merge branches: {}", branches.join(", "));
        let mut args = vec!["merge", "--no-ff", "-m", &message];
        args.extend(branches.iter().map(String::as_str));

        match self.git(workspace, &args).await {
            Ok(_) => self.head_commit(workspace).await,
            Err(WorkspaceError::Git { output, .. }) => Err(WorkspaceError::MergeFailed {
                branch: branches.join(", "),
                output,
            }),
            Err(err) => Err(err),
        }
    }

    async fn has_conflicts(
        &self,
        workspace: &Path,
    ) -> Result<(bool, Vec<String>), WorkspaceError> {
        let output = self
            .git(workspace, &["diff", "--name-only", "--diff-filter=U"])
            .await?;
        let files: Vec<String> = output
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.to_string())
            .collect();
        Ok((!files.is_empty(), files))
    }

    async fn abort_merge(&self, workspace: &Path) -> Result<(), WorkspaceError> {
        self.git(workspace, &["merge", "--abort"]).await?;
        Ok(())
    }

    async fn checkout(&self, workspace: &Path, branch: &str) -> Result<(), WorkspaceError> {
        self.git(workspace, &["checkout", branch]).await?;
        Ok(())
    }

    async fn commit_changes(
        &self,
        workspace: &Path,
        message: &str,
    ) -> Result<Option<String>, WorkspaceError> {
        self.git(workspace, &["add", "-A"]).await?;

        let commit = self.git(workspace, &["commit", "-m", message]).await;
        match commit {
            Ok(_) => {}
            Err(WorkspaceError::Git { output, .. })
                if output.contains("nothing to commit") =>
            {
                debug!(workspace = %workspace.display(), "nothing to commit");
                return Ok(None);
            }
            Err(err) => return Err(err),
        }

        let commit = self.head_commit(workspace).await?;
        Ok(Some(commit))
    }

    async fn remove(&self, path: &Path) -> Result<(), WorkspaceError> {
        let path_str = path.to_string_lossy().to_string();
        let result = self
            .git(
                &self.repo_path,
                &["worktree", "remove", "--force", &path_str],
            )
            .await;

        if let Err(err) = result {
            warn!("failed to remove worktree via git: {err}");
            if path.exists() {
                tokio::fs::remove_dir_all(path).await?;
            }
            let _ = self.git(&self.repo_path, &["worktree", "prune"]).await;
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Worktree>, WorkspaceError> {
        let output = self
            .git(&self.repo_path, &["worktree", "list", "--porcelain"])
            .await?;
        Ok(parse_worktree_list(&output))
    }
}

/// Parse `git worktree list --porcelain` output. Blocks are separated by
/// blank lines; each block carries `worktree`, `HEAD`, and `branch` lines.
fn parse_worktree_list(output: &str) -> Vec<Worktree> {
    let mut worktrees = Vec::new();
    let mut path = String::new();
    let mut branch = String::new();
    let mut commit = String::new();

    let mut flush = |path: &mut String, branch: &mut String, commit: &mut String| {
        if !path.is_empty() {
            worktrees.push(Worktree {
                path: PathBuf::from(std::mem::take(path)),
                branch: std::mem::take(branch),
                commit: std::mem::take(commit),
            });
        } else {
            path.clear();
            branch.clear();
            commit.clear();
        }
    };

    for line in output.lines() {
        if line.is_empty() {
            flush(&mut path, &mut branch, &mut commit);
            continue;
        }
        if let Some(value) = line.strip_prefix("worktree ") {
            path = value.to_string();
        } else if let Some(value) = line.strip_prefix("HEAD ") {
            commit = value.to_string();
        } else if let Some(value) = line.strip_prefix("branch ") {
            branch = value.trim_start_matches("refs/heads/").to_string();
        }
    }
    flush(&mut path, &mut branch, &mut commit);

    worktrees
}
