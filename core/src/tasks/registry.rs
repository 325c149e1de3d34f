//! Background task registry
//!
//! Every long-lived loop (monitors, cleanup, reapers, heartbeats, pruners)
//! is spawned through this registry so shutdown can cancel the lot with one
//! call. Cancellation is graceful first: a shutdown signal is broadcast and
//! each task gets the remainder of the deadline to exit on its own before
//! being aborted. A panicking task takes only itself down; the failure is
//! logged when the task is joined.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const DEFAULT_CANCEL_DEADLINE: Duration = Duration::from_secs(30);

pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            tasks: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// Spawn and track a named background task. A task spawned under a name
    /// that is already live replaces (and aborts) the old one.
    pub fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        tasks.retain(|_, handle| !handle.is_finished());

        let handle = tokio::spawn(future);
        if let Some(old) = tasks.insert(name.to_string(), handle) {
            debug!("replacing background task {}", name);
            old.abort();
        }
        debug!("spawned background task {}", name);
    }

    /// Receiver on which tasks can watch for the shutdown signal; loops
    /// that hold locks across suspension points should select on it.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Cancel one task by name. Returns whether it existed.
    pub fn cancel(&self, name: &str) -> bool {
        match self.tasks.lock().remove(name) {
            Some(handle) => {
                handle.abort();
                debug!("cancelled background task {}", name);
                true
            }
            None => false,
        }
    }

    /// Number of live tracked tasks.
    pub fn task_count(&self) -> usize {
        self.tasks
            .lock()
            .values()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Cancel everything: signal shutdown, give tasks up to `deadline` to
    /// exit cooperatively, then abort stragglers. Idempotent.
    pub async fn cancel_all(&self, deadline: Duration) {
        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut tasks = self.tasks.lock();
            tasks.drain().collect()
        };
        if handles.is_empty() {
            return;
        }

        info!("cancelling {} background tasks", handles.len());
        let _ = self.shutdown.send(true);

        let deadline_at = tokio::time::Instant::now() + deadline;
        for (name, handle) in handles {
            let abort = handle.abort_handle();
            let remaining = deadline_at.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(())) => debug!("task {} exited cleanly", name),
                Ok(Err(e)) if e.is_panic() => {
                    error!("task {} panicked: {}", name, e);
                }
                Ok(Err(_)) => debug!("task {} was cancelled", name),
                Err(_) => {
                    warn!("task {} missed the shutdown deadline, aborting", name);
                    abort.abort();
                }
            }
        }

        info!("all background tasks cancelled");
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_spawn_and_count() {
        let registry = TaskRegistry::new();
        registry.spawn("sleeper", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        assert_eq!(registry.task_count(), 1);
        registry.cancel("sleeper");
        assert_eq!(registry.task_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_unknown_task() {
        let registry = TaskRegistry::new();
        assert!(!registry.cancel("ghost"));
    }

    #[tokio::test]
    async fn test_graceful_shutdown_via_signal() {
        let registry = TaskRegistry::new();
        let exited = Arc::new(AtomicBool::new(false));

        let mut signal = registry.shutdown_signal();
        let exited_clone = Arc::clone(&exited);
        registry.spawn("cooperative", async move {
            loop {
                tokio::select! {
                    _ = signal.changed() => {
                        exited_clone.store(true, Ordering::SeqCst);
                        break;
                    }
                    _ = tokio::time::sleep(Duration::from_secs(10)) => {}
                }
            }
        });

        registry.cancel_all(Duration::from_secs(2)).await;
        assert!(exited.load(Ordering::SeqCst));
        assert_eq!(registry.task_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_all_is_idempotent() {
        let registry = TaskRegistry::new();
        registry.spawn("a", async {});
        registry.cancel_all(Duration::from_millis(100)).await;
        registry.cancel_all(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_replacing_task_by_name() {
        let registry = TaskRegistry::new();
        registry.spawn("worker", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        registry.spawn("worker", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        assert_eq!(registry.task_count(), 1);
        registry.cancel_all(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_panicking_task_is_isolated() {
        let registry = TaskRegistry::new();
        registry.spawn("panics", async {
            panic!("task blew up");
        });
        registry.spawn("survives", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        // The panic took down only its own task.
        assert_eq!(registry.task_count(), 1);
        registry.cancel_all(Duration::from_millis(100)).await;
    }
}
