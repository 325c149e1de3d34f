//! Task execution engine
//!
//! Runs a DAG of named tasks. Tasks become runnable once every dependency
//! has completed; among runnables the highest priority goes first, and
//! same-priority runnables execute concurrently. A task whose dependency
//! failed or was skipped is skipped itself. When a pass makes no progress
//! but tasks remain pending, the graph has a cycle and the remainder is
//! failed.

use futures::future::{join_all, BoxFuture};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Task priority levels
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Deferred = 0,
    Low = 1,
    Normal = 2,
    High = 3,
    Critical = 4,
}

/// Lifecycle state of a task in the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

type TaskFactory = Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A named task with priority, dependencies, and retry policy
pub struct TaskSpec {
    pub name: String,
    pub priority: TaskPriority,
    pub dependencies: Vec<String>,
    pub retries: u32,
    pub retry_backoff: Duration,
    factory: TaskFactory,
}

impl TaskSpec {
    pub fn new<F, Fut>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            priority: TaskPriority::Normal,
            dependencies: Vec::new(),
            retries: 0,
            retry_backoff: Duration::from_millis(100),
            factory: Box::new(move || Box::pin(factory())),
        }
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, dependencies: &[&str]) -> Self {
        self.dependencies = dependencies.iter().map(|d| d.to_string()).collect();
        self
    }

    /// Retry up to `retries` times with exponential backoff from `base`.
    pub fn retries(mut self, retries: u32, base: Duration) -> Self {
        self.retries = retries;
        self.retry_backoff = base;
        self
    }
}

/// Executes a registered task graph.
pub struct TaskEngine {
    tasks: HashMap<String, TaskSpec>,
    status: HashMap<String, TaskStatus>,
    errors: HashMap<String, String>,
    execution_order: Vec<String>,
}

impl TaskEngine {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            status: HashMap::new(),
            errors: HashMap::new(),
            execution_order: Vec::new(),
        }
    }

    pub fn register(&mut self, task: TaskSpec) {
        self.status.insert(task.name.clone(), TaskStatus::Pending);
        self.tasks.insert(task.name.clone(), task);
    }

    pub fn status(&self, name: &str) -> Option<TaskStatus> {
        self.status.get(name).copied()
    }

    pub fn error(&self, name: &str) -> Option<&str> {
        self.errors.get(name).map(String::as_str)
    }

    /// Order in which tasks finished (completed or failed).
    pub fn execution_order(&self) -> &[String] {
        &self.execution_order
    }

    fn dependencies_completed(&self, name: &str) -> bool {
        self.tasks[name]
            .dependencies
            .iter()
            .all(|dep| self.status.get(dep) == Some(&TaskStatus::Completed))
    }

    fn dependency_failed(&self, name: &str) -> bool {
        self.tasks[name].dependencies.iter().any(|dep| {
            matches!(
                self.status.get(dep),
                Some(TaskStatus::Failed) | Some(TaskStatus::Skipped)
            )
        })
    }

    /// Run the whole graph to completion and return the final statuses.
    pub async fn run_all(&mut self) -> HashMap<String, TaskStatus> {
        loop {
            let pending: Vec<String> = self
                .status
                .iter()
                .filter(|(_, s)| **s == TaskStatus::Pending)
                .map(|(n, _)| n.clone())
                .collect();
            if pending.is_empty() {
                break;
            }

            let mut progressed = false;
            for name in &pending {
                if self.dependency_failed(name) {
                    debug!("skipping task {} (failed dependency)", name);
                    self.status.insert(name.clone(), TaskStatus::Skipped);
                    progressed = true;
                }
            }

            let runnable: Vec<String> = pending
                .iter()
                .filter(|n| self.status[*n] == TaskStatus::Pending)
                .filter(|n| self.dependencies_completed(n))
                .cloned()
                .collect();

            if runnable.is_empty() {
                if !progressed {
                    // No task can make progress and none just got skipped:
                    // the remaining pending tasks form a cycle.
                    warn!("dependency cycle detected, failing remaining tasks");
                    for name in pending {
                        if self.status[&name] == TaskStatus::Pending {
                            self.status.insert(name.clone(), TaskStatus::Failed);
                            self.errors
                                .insert(name, "unresolvable dependency cycle".to_string());
                        }
                    }
                    break;
                }
                continue;
            }

            let top_priority = runnable
                .iter()
                .map(|n| self.tasks[n].priority)
                .max()
                .unwrap_or(TaskPriority::Normal);
            let batch: Vec<String> = runnable
                .into_iter()
                .filter(|n| self.tasks[n].priority == top_priority)
                .collect();

            for name in &batch {
                self.status.insert(name.clone(), TaskStatus::Running);
            }

            let outcomes = join_all(
                batch
                    .iter()
                    .map(|name| Self::run_with_retries(&self.tasks[name])),
            )
            .await;

            for (name, outcome) in batch.into_iter().zip(outcomes) {
                match outcome {
                    Ok(()) => {
                        self.status.insert(name.clone(), TaskStatus::Completed);
                    }
                    Err(e) => {
                        warn!("task {} failed: {}", name, e);
                        self.status.insert(name.clone(), TaskStatus::Failed);
                        self.errors.insert(name.clone(), e);
                    }
                }
                self.execution_order.push(name);
            }
        }

        self.status.clone()
    }

    async fn run_with_retries(spec: &TaskSpec) -> Result<(), String> {
        let mut attempt = 0u32;
        loop {
            match (spec.factory)().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    if attempt > spec.retries {
                        return Err(e.to_string());
                    }
                    let backoff = spec.retry_backoff * 2u32.pow(attempt - 1);
                    debug!(
                        "task {} attempt {} failed, retrying in {:?}: {}",
                        spec.name, attempt, backoff, e
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

impl Default for TaskEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_dependency_ordering() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut engine = TaskEngine::new();

        for (name, deps) in [("c", vec!["b"]), ("a", vec![]), ("b", vec!["a"])] {
            let order = Arc::clone(&order);
            let mut spec = TaskSpec::new(name, move || {
                let order = Arc::clone(&order);
                async move {
                    order.lock().push(name);
                    Ok(())
                }
            });
            spec.dependencies = deps.iter().map(|d| d.to_string()).collect();
            engine.register(spec);
        }

        let statuses = engine.run_all().await;
        assert!(statuses.values().all(|s| *s == TaskStatus::Completed));
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_completed_implies_dependencies_completed() {
        let mut engine = TaskEngine::new();
        engine.register(TaskSpec::new("root", || async { anyhow::bail!("nope") }));
        engine.register(TaskSpec::new("child", || async { Ok(()) }).depends_on(&["root"]));
        engine
            .register(TaskSpec::new("grandchild", || async { Ok(()) }).depends_on(&["child"]));

        let statuses = engine.run_all().await;
        assert_eq!(statuses["root"], TaskStatus::Failed);
        assert_eq!(statuses["child"], TaskStatus::Skipped);
        assert_eq!(statuses["grandchild"], TaskStatus::Skipped);
    }

    #[tokio::test]
    async fn test_priority_ordering() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut engine = TaskEngine::new();

        for (name, priority) in [
            ("low", TaskPriority::Low),
            ("critical", TaskPriority::Critical),
            ("normal", TaskPriority::Normal),
        ] {
            let order = Arc::clone(&order);
            engine.register(
                TaskSpec::new(name, move || {
                    let order = Arc::clone(&order);
                    async move {
                        order.lock().push(name);
                        Ok(())
                    }
                })
                .priority(priority),
            );
        }

        engine.run_all().await;
        assert_eq!(*order.lock(), vec!["critical", "normal", "low"]);
    }

    #[tokio::test]
    async fn test_retries_with_backoff() {
        let attempts = Arc::new(AtomicU32::new(0));
        let mut engine = TaskEngine::new();
        {
            let attempts = Arc::clone(&attempts);
            engine.register(
                TaskSpec::new("flaky", move || {
                    let attempts = Arc::clone(&attempts);
                    async move {
                        if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                            anyhow::bail!("transient");
                        }
                        Ok(())
                    }
                })
                .retries(3, Duration::from_millis(1)),
            );
        }

        let statuses = engine.run_all().await;
        assert_eq!(statuses["flaky"], TaskStatus::Completed);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_marks_failed() {
        let attempts = Arc::new(AtomicU32::new(0));
        let mut engine = TaskEngine::new();
        {
            let attempts = Arc::clone(&attempts);
            engine.register(
                TaskSpec::new("doomed", move || {
                    let attempts = Arc::clone(&attempts);
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        anyhow::bail!("always fails")
                    }
                })
                .retries(2, Duration::from_millis(1)),
            );
        }

        let statuses = engine.run_all().await;
        assert_eq!(statuses["doomed"], TaskStatus::Failed);
        // 1 initial + 2 retries
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(engine.error("doomed"), Some("always fails"));
    }

    #[tokio::test]
    async fn test_cycle_detection() {
        let mut engine = TaskEngine::new();
        engine.register(TaskSpec::new("a", || async { Ok(()) }).depends_on(&["b"]));
        engine.register(TaskSpec::new("b", || async { Ok(()) }).depends_on(&["a"]));

        let statuses = engine.run_all().await;
        assert_eq!(statuses["a"], TaskStatus::Failed);
        assert_eq!(statuses["b"], TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_same_priority_runs_concurrently() {
        let in_flight = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let mut engine = TaskEngine::new();

        for name in ["x", "y", "z"] {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            engine.register(TaskSpec::new(name, move || {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                async move {
                    let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(current, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            }));
        }

        engine.run_all().await;
        assert!(peak.load(Ordering::SeqCst) > 1);
    }

    #[test]
    fn test_priority_order() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
        assert!(TaskPriority::Low > TaskPriority::Deferred);
    }
}
