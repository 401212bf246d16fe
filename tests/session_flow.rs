// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Full session pipeline: decompose, execute, merge.
//!
//! Agents are scripted; workspaces are real git worktrees, so these tests
//! run only where git is installed.

mod common;

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use codecrew::agent::AgentRuntime;
use codecrew::config::Config;
use codecrew::session::{SessionEventKind, SessionManager, SessionStatus};
use codecrew::task::TaskStatus;

use common::{new_op_log, MockRuntime};

const DECOMPOSITION: &str = r#"{
    "description": "Two independent modules, then wiring",
    "tasks": [
        {"id": "a", "title": "Module A", "description": "build module A", "dependsOn": []},
        {"id": "b", "title": "Module B", "description": "build module B", "dependsOn": []},
        {"id": "c", "title": "Wire up", "description": "wire A and B together", "dependsOn": ["a", "b"]}
    ],
    "totalEstimatedTime": "30 min"
}"#;

async fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

async fn init_repo(dir: &Path) {
    for args in [
        vec!["init", "-b", "main"],
        vec!["config", "user.name", "codecrew-test"],
        vec!["config", "user.email", "codecrew-test@example.com"],
    ] {
        let status = Command::new("git")
            .args(&args)
            .current_dir(dir)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .unwrap();
        assert!(status.success(), "git {args:?} failed");
    }
    tokio::fs::write(dir.join("README.md"), "seed\n").await.unwrap();
    for args in [vec!["add", "-A"], vec!["commit", "-m", "initial"]] {
        let status = Command::new("git")
            .args(&args)
            .current_dir(dir)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .unwrap();
        assert!(status.success(), "git {args:?} failed");
    }
}

#[tokio::test]
async fn full_session_pipeline() {
    if !git_available().await {
        return;
    }
    let temp = tempfile::tempdir().unwrap();
    init_repo(temp.path()).await;

    let log = new_op_log();
    let runtime = Arc::new(MockRuntime::new(Arc::clone(&log)));
    runtime.script_output("orchestrator-", DECOMPOSITION);

    let config = Config {
        agent_bin: "unused".into(),
        repo_path: temp.path().to_path_buf(),
        max_parallel: 2,
        base_branch: "main".to_string(),
    };
    let manager =
        SessionManager::with_runtime(config, Arc::clone(&runtime) as Arc<dyn AgentRuntime>);

    let session = manager.create("build modules A and B, then wire them").await;
    let mut events = session.subscribe();
    let cancel = CancellationToken::new();

    assert_eq!(session.status().await, SessionStatus::Created);

    session.decompose(&cancel).await.unwrap();
    assert_eq!(session.status().await, SessionStatus::Ready);
    assert_eq!(session.dag.len().await, 3);
    assert!(session.started_at().await.is_some());

    session.execute(&cancel).await.unwrap();
    assert_eq!(session.status().await, SessionStatus::Merging);
    for task in session.dag.tasks().await {
        assert_eq!(task.status, TaskStatus::Completed, "task {}", task.id);
        assert_eq!(task.branch_name, format!("task-{}", task.id));
    }
    // c's workspace merged both dependency branches.
    let c = session.dag.get("c").await.unwrap();
    assert_eq!(c.merged_commits.len(), 2);

    session.merge(&cancel).await.unwrap();
    assert_eq!(session.status().await, SessionStatus::Completed);
    assert!(session.completed_at().await.is_some());

    // The stream saw decomposition, execution, per-task lifecycle, and the
    // final merge.
    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind);
    }
    assert!(kinds.contains(&SessionEventKind::Decomposed));
    assert!(kinds.contains(&SessionEventKind::Executing));
    assert!(kinds.contains(&SessionEventKind::TaskStarted));
    assert!(kinds.contains(&SessionEventKind::TaskCompleted));
    assert!(kinds.contains(&SessionEventKind::Merged));
    assert!(!kinds.contains(&SessionEventKind::Error));
    assert!(!kinds.contains(&SessionEventKind::TaskFailed));
}

#[tokio::test]
async fn session_fails_on_undecodable_decomposition() {
    if !git_available().await {
        return;
    }
    let temp = tempfile::tempdir().unwrap();
    init_repo(temp.path()).await;

    let log = new_op_log();
    let runtime = Arc::new(MockRuntime::new(Arc::clone(&log)));
    runtime.script_output("orchestrator-", "I cannot help with that.");

    let config = Config {
        agent_bin: "unused".into(),
        repo_path: temp.path().to_path_buf(),
        max_parallel: 2,
        base_branch: "main".to_string(),
    };
    let manager =
        SessionManager::with_runtime(config, Arc::clone(&runtime) as Arc<dyn AgentRuntime>);

    let session = manager.create("do something").await;
    let mut events = session.subscribe();
    let cancel = CancellationToken::new();

    let err = session.decompose(&cancel).await.unwrap_err();
    assert!(err.to_string().contains("decomposition failed"));
    assert_eq!(session.status().await, SessionStatus::Failed);

    // No partial graph was created.
    assert!(session.dag.is_empty().await);

    let mut saw_error = false;
    while let Ok(event) = events.try_recv() {
        if event.kind == SessionEventKind::Error {
            saw_error = true;
        }
    }
    assert!(saw_error);
}

#[tokio::test]
async fn session_fails_when_worker_fails() {
    if !git_available().await {
        return;
    }
    let temp = tempfile::tempdir().unwrap();
    init_repo(temp.path()).await;

    let log = new_op_log();
    let runtime = Arc::new(MockRuntime::new(Arc::clone(&log)));
    runtime.script_output("orchestrator-", DECOMPOSITION);
    runtime.fail_agent("agent-a");

    let config = Config {
        agent_bin: "unused".into(),
        repo_path: temp.path().to_path_buf(),
        max_parallel: 2,
        base_branch: "main".to_string(),
    };
    let manager =
        SessionManager::with_runtime(config, Arc::clone(&runtime) as Arc<dyn AgentRuntime>);

    let session = manager.create("build modules A and B, then wire them").await;
    let cancel = CancellationToken::new();

    session.decompose(&cancel).await.unwrap();
    let err = session.execute(&cancel).await.unwrap_err();
    assert!(err.to_string().contains("execution failed"));
    assert_eq!(session.status().await, SessionStatus::Failed);

    let a = session.dag.get("a").await.unwrap();
    assert_eq!(a.status, TaskStatus::Failed);
    // Every task ended terminal even though the session failed.
    for task in session.dag.tasks().await {
        assert!(task.status.is_terminal());
    }
}
