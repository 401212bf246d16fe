// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Directed acyclic graph of tasks.
//!
//! The graph owns every task; callers operate on snapshots and mutate through
//! the atomic helpers, so there is a single writer per task at any time. All
//! operations take the internal lock, and `ready_tasks` observes a consistent
//! snapshot.

use std::collections::{HashMap, VecDeque};

use chrono::Utc;
use tokio::sync::RwLock;

use super::types::{Task, TaskStatus};
use crate::error::DagError;

/// Colours for cycle-detecting DFS.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Colour {
    White,
    Grey,
    Black,
}

/// A dependency graph of tasks keyed by ID.
#[derive(Default)]
pub struct Dag {
    tasks: RwLock<HashMap<String, Task>>,
}

impl Dag {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task. Fails if a task with the same ID already exists.
    pub async fn add_task(&self, task: Task) -> Result<(), DagError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(DagError::TaskExists(task.id));
        }
        tasks.insert(task.id.clone(), task);
        Ok(())
    }

    /// Retrieve a snapshot of a task by ID.
    pub async fn get(&self, id: &str) -> Option<Task> {
        let tasks = self.tasks.read().await;
        tasks.get(id).cloned()
    }

    /// Snapshot of every task, in unspecified order.
    pub async fn tasks(&self) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        tasks.values().cloned().collect()
    }

    /// Number of tasks in the graph.
    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Check if the graph is empty.
    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    /// Tasks whose status is pending and whose every dependency is completed.
    ///
    /// Tasks with no dependencies are included while pending. A task whose
    /// dependency ID does not resolve is never ready. The order of the
    /// returned list is unspecified.
    pub async fn ready_tasks(&self) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| {
                t.depends_on.iter().all(|dep| {
                    tasks
                        .get(dep)
                        .map(|d| d.status == TaskStatus::Completed)
                        .unwrap_or(false)
                })
            })
            .cloned()
            .collect()
    }

    /// Unchecked status write. Prefer the atomic helpers below.
    pub async fn update_status(&self, id: &str, status: TaskStatus) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(id) {
            task.status = status;
        }
    }

    /// Atomically mark a task running and stamp its start time.
    pub async fn set_task_started(&self, id: &str) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(id) {
            task.status = TaskStatus::Running;
            task.started_at = Some(Utc::now());
        }
    }

    /// Atomically mark a task completed and stamp its completion time.
    pub async fn set_task_completed(&self, id: &str) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(id) {
            task.status = TaskStatus::Completed;
            task.completed_at = Some(Utc::now());
        }
    }

    /// Atomically mark a task failed with an error message.
    pub async fn set_task_failed(&self, id: &str, message: impl Into<String>) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(id) {
            task.status = TaskStatus::Failed;
            task.error = message.into();
            task.completed_at = Some(Utc::now());
        }
    }

    /// Record the branch assigned to a task.
    pub async fn set_task_branch(&self, id: &str, branch: &str) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(id) {
            task.branch_name = branch.to_string();
        }
    }

    /// Record the workspace a task runs in and its base revision.
    pub async fn set_task_workspace(&self, id: &str, path: &str, base_commit: &str) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(id) {
            task.workspace_path = path.to_string();
            task.base_commit = base_commit.to_string();
        }
    }

    /// Record the agent assigned to a task.
    pub async fn set_task_agent(&self, id: &str, agent_id: &str) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(id) {
            task.agent_id = agent_id.to_string();
        }
    }

    /// Record a merge commit produced while preparing a task's workspace.
    pub async fn add_merged_commit(&self, id: &str, commit: &str) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(id) {
            task.merged_commits.push(commit.to_string());
        }
    }

    /// Record the revision produced by a task's commit.
    pub async fn update_task_result(&self, id: &str, commit: &str) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(id) {
            task.result_commit = commit.to_string();
        }
    }

    /// Append output lines accumulated from the task's agent.
    pub async fn append_task_output(&self, id: &str, lines: impl IntoIterator<Item = String>) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(id) {
            task.output.extend(lines);
        }
    }

    /// Branch names of a task's direct dependencies, skipping unassigned ones.
    pub async fn get_dependency_branches(&self, id: &str) -> Vec<String> {
        let tasks = self.tasks.read().await;
        let Some(task) = tasks.get(id) else {
            return Vec::new();
        };
        task.depends_on
            .iter()
            .filter_map(|dep| tasks.get(dep))
            .filter(|dep| !dep.branch_name.is_empty())
            .map(|dep| dep.branch_name.clone())
            .collect()
    }

    /// True iff every task is in a terminal status.
    pub async fn all_completed(&self) -> bool {
        let tasks = self.tasks.read().await;
        tasks.values().all(|t| t.status.is_terminal())
    }

    /// True iff any task has failed.
    pub async fn has_failed(&self) -> bool {
        let tasks = self.tasks.read().await;
        tasks.values().any(|t| t.status == TaskStatus::Failed)
    }

    /// Detect a cycle with three-colour DFS over the `depends_on` edges.
    /// Revisiting a grey node is a back edge.
    pub async fn has_cycle(&self) -> bool {
        let tasks = self.tasks.read().await;
        has_cycle_in(&tasks)
    }

    /// Tasks in topological order via Kahn's algorithm.
    ///
    /// Fails if the graph contains a cycle. Ties are broken by task ID so the
    /// order is deterministic.
    pub async fn topological_order(&self) -> Result<Vec<Task>, DagError> {
        let tasks = self.tasks.read().await;
        if has_cycle_in(&tasks) {
            return Err(DagError::CycleDetected);
        }

        // In-degree of a task is the number of distinct resolvable dependencies.
        let mut in_degree: HashMap<&str, usize> = tasks
            .values()
            .map(|t| {
                let degree = t
                    .depends_on
                    .iter()
                    .filter(|dep| tasks.contains_key(dep.as_str()))
                    .collect::<std::collections::HashSet<_>>()
                    .len();
                (t.id.as_str(), degree)
            })
            .collect();

        let mut queue: VecDeque<&str> = {
            let mut seeds: Vec<&str> = in_degree
                .iter()
                .filter(|(_, d)| **d == 0)
                .map(|(id, _)| *id)
                .collect();
            seeds.sort_unstable();
            seeds.into()
        };

        let mut result = Vec::with_capacity(tasks.len());
        while let Some(current) = queue.pop_front() {
            if let Some(task) = tasks.get(current) {
                result.push(task.clone());
            }

            let mut unblocked: Vec<&str> = Vec::new();
            for task in tasks.values() {
                if task.depends_on.iter().any(|dep| dep == current) {
                    if let Some(degree) = in_degree.get_mut(task.id.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            unblocked.push(task.id.as_str());
                        }
                    }
                }
            }
            unblocked.sort_unstable();
            queue.extend(unblocked);
        }

        Ok(result)
    }
}

fn has_cycle_in(tasks: &HashMap<String, Task>) -> bool {
    let mut colours: HashMap<&str, Colour> =
        tasks.keys().map(|id| (id.as_str(), Colour::White)).collect();

    fn visit<'a>(
        tasks: &'a HashMap<String, Task>,
        colours: &mut HashMap<&'a str, Colour>,
        id: &'a str,
    ) -> bool {
        match colours.get(id) {
            Some(Colour::Grey) => return true,
            Some(Colour::Black) | None => return false,
            Some(Colour::White) => {}
        }
        colours.insert(id, Colour::Grey);
        if let Some(task) = tasks.get(id) {
            for dep in &task.depends_on {
                if tasks.contains_key(dep) && visit(tasks, colours, dep) {
                    return true;
                }
            }
        }
        colours.insert(id, Colour::Black);
        false
    }

    let ids: Vec<&str> = tasks.keys().map(String::as_str).collect();
    for id in ids {
        if colours.get(id) == Some(&Colour::White) && visit(tasks, &mut colours, id) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str]) -> Task {
        Task::new(
            id,
            format!("Task {id}"),
            format!("do {id}"),
            deps.iter().map(|s| s.to_string()).collect(),
        )
    }

    async fn linear_dag() -> Dag {
        // a <- b <- c
        let dag = Dag::new();
        dag.add_task(task("a", &[])).await.unwrap();
        dag.add_task(task("b", &["a"])).await.unwrap();
        dag.add_task(task("c", &["b"])).await.unwrap();
        dag
    }

    #[tokio::test]
    async fn test_add_duplicate_task_fails() {
        let dag = Dag::new();
        dag.add_task(task("a", &[])).await.unwrap();
        let err = dag.add_task(task("a", &[])).await.unwrap_err();
        assert!(matches!(err, DagError::TaskExists(id) if id == "a"));
    }

    #[tokio::test]
    async fn test_ready_tasks_respects_dependencies() {
        let dag = linear_dag().await;

        let ready = dag.ready_tasks().await;
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "a");

        dag.set_task_completed("a").await;
        let ready = dag.ready_tasks().await;
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "b");

        dag.set_task_completed("b").await;
        dag.set_task_completed("c").await;
        assert!(dag.ready_tasks().await.is_empty());
        assert!(dag.all_completed().await);
    }

    #[tokio::test]
    async fn test_ready_tasks_excludes_non_pending() {
        let dag = linear_dag().await;
        dag.set_task_started("a").await;
        assert!(dag.ready_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_dependency_never_ready() {
        let dag = Dag::new();
        dag.add_task(task("orphan", &["ghost"])).await.unwrap();
        assert!(dag.ready_tasks().await.is_empty());
        // Not a cycle either.
        assert!(!dag.has_cycle().await);
    }

    #[tokio::test]
    async fn test_ready_set_property() {
        // Property 1: t is ready iff pending and all deps completed.
        let dag = Dag::new();
        dag.add_task(task("a", &[])).await.unwrap();
        dag.add_task(task("b", &["a"])).await.unwrap();
        dag.add_task(task("c", &["a"])).await.unwrap();
        dag.add_task(task("d", &["b", "c"])).await.unwrap();

        dag.set_task_completed("a").await;
        dag.set_task_completed("b").await;
        // c still pending, so d must not be ready.
        let ready: Vec<String> = dag.ready_tasks().await.into_iter().map(|t| t.id).collect();
        assert_eq!(ready, vec!["c".to_string()]);

        dag.set_task_completed("c").await;
        let ready: Vec<String> = dag.ready_tasks().await.into_iter().map(|t| t.id).collect();
        assert_eq!(ready, vec!["d".to_string()]);
    }

    #[tokio::test]
    async fn test_cycle_detection() {
        let dag = Dag::new();
        dag.add_task(task("a", &["b"])).await.unwrap();
        dag.add_task(task("b", &["a"])).await.unwrap();
        assert!(dag.has_cycle().await);
        assert!(matches!(
            dag.topological_order().await,
            Err(DagError::CycleDetected)
        ));
    }

    #[tokio::test]
    async fn test_self_cycle_detection() {
        let dag = Dag::new();
        dag.add_task(task("a", &["a"])).await.unwrap();
        assert!(dag.has_cycle().await);
    }

    #[tokio::test]
    async fn test_acyclic_graph_has_no_cycle() {
        let dag = linear_dag().await;
        assert!(!dag.has_cycle().await);
    }

    #[tokio::test]
    async fn test_topological_order_linear() {
        let dag = linear_dag().await;
        let order: Vec<String> = dag
            .topological_order()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_topological_order_is_valid_permutation() {
        // Property 2: for every edge u -> v (v depends on u), u precedes v.
        let dag = Dag::new();
        dag.add_task(task("a", &[])).await.unwrap();
        dag.add_task(task("b", &["a"])).await.unwrap();
        dag.add_task(task("c", &["a"])).await.unwrap();
        dag.add_task(task("d", &["b", "c"])).await.unwrap();
        dag.add_task(task("e", &[])).await.unwrap();

        let order = dag.topological_order().await.unwrap();
        assert_eq!(order.len(), 5);

        let position: HashMap<String, usize> = order
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();
        for t in &order {
            for dep in &t.depends_on {
                assert!(
                    position[dep] < position[&t.id],
                    "dependency {dep} must precede {}",
                    t.id
                );
            }
        }
    }

    #[tokio::test]
    async fn test_topological_order_round_trip() {
        // Property 3: completing tasks in topological order keeps every
        // task's dependencies completed before it runs.
        let dag = Dag::new();
        dag.add_task(task("a", &[])).await.unwrap();
        dag.add_task(task("b", &["a"])).await.unwrap();
        dag.add_task(task("c", &["a"])).await.unwrap();
        dag.add_task(task("d", &["b", "c"])).await.unwrap();

        for t in dag.topological_order().await.unwrap() {
            let ready: Vec<String> = dag.ready_tasks().await.into_iter().map(|x| x.id).collect();
            assert!(ready.contains(&t.id), "{} should be ready", t.id);
            dag.set_task_completed(&t.id).await;
        }
        assert!(dag.all_completed().await);
    }

    #[tokio::test]
    async fn test_set_task_failed_records_error() {
        let dag = linear_dag().await;
        dag.set_task_failed("a", "agent crashed").await;

        let t = dag.get("a").await.unwrap();
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.error, "agent crashed");
        assert!(t.completed_at.is_some());
        assert!(dag.has_failed().await);
        assert!(!dag.all_completed().await);
    }

    #[tokio::test]
    async fn test_dependency_branches() {
        let dag = Dag::new();
        dag.add_task(task("a", &[])).await.unwrap();
        dag.add_task(task("b", &[])).await.unwrap();
        dag.add_task(task("d", &["a", "b"])).await.unwrap();

        dag.set_task_branch("a", "task-a").await;
        // b has no branch yet and is skipped.
        let branches = dag.get_dependency_branches("d").await;
        assert_eq!(branches, vec!["task-a".to_string()]);

        dag.set_task_branch("b", "task-b").await;
        let branches = dag.get_dependency_branches("d").await;
        assert_eq!(branches.len(), 2);
        assert!(branches.contains(&"task-a".to_string()));
        assert!(branches.contains(&"task-b".to_string()));
    }

    #[tokio::test]
    async fn test_result_and_output_helpers() {
        let dag = linear_dag().await;
        dag.update_task_result("a", "abc123").await;
        dag.add_merged_commit("a", "m1").await;
        dag.append_task_output("a", vec!["hello".to_string(), "world".to_string()])
            .await;
        dag.set_task_workspace("a", "/tmp/wt", "base0").await;
        dag.set_task_agent("a", "agent-a").await;

        let t = dag.get("a").await.unwrap();
        assert_eq!(t.result_commit, "abc123");
        assert_eq!(t.merged_commits, vec!["m1".to_string()]);
        assert_eq!(t.output, vec!["hello".to_string(), "world".to_string()]);
        assert_eq!(t.workspace_path, "/tmp/wt");
        assert_eq!(t.base_commit, "base0");
        assert_eq!(t.agent_id, "agent-a");
    }

    #[tokio::test]
    async fn test_all_completed_counts_cancelled_and_failed() {
        let dag = linear_dag().await;
        dag.set_task_completed("a").await;
        dag.set_task_failed("b", "boom").await;
        dag.update_status("c", TaskStatus::Cancelled).await;
        assert!(dag.all_completed().await);
    }
}
