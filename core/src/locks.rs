//! Per-resource locks and atomic multi-resource execution
//!
//! Any multi-step critical section that suspends goes through this manager.
//! `execute_atomic` takes every lock named by its operations in sorted
//! order (one global order, so two atomic batches can never deadlock), runs
//! the operations in the order given, and on failure invokes the rollbacks
//! of completed operations in reverse. Locks are guard-scoped and released
//! on every exit path.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{error, warn};

type OpFn<T> = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<T>> + Send>;
type RollbackFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// One operation in an atomic batch
pub struct AtomicOperation<T> {
    pub resource_id: String,
    operation: OpFn<T>,
    rollback: Option<RollbackFn>,
}

impl<T: Send + 'static> AtomicOperation<T> {
    pub fn new<F, Fut>(resource_id: impl Into<String>, operation: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            resource_id: resource_id.into(),
            operation: Box::new(move || Box::pin(operation())),
            rollback: None,
        }
    }

    /// Attach a rollback, invoked if a later operation in the batch fails.
    pub fn with_rollback<F, Fut>(mut self, rollback: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.rollback = Some(Box::new(move || Box::pin(rollback())));
        self
    }
}

/// Per-resource async locks, created on first use.
pub struct ResourceLockManager {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ResourceLockManager {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the lock for one resource. The guard releases on drop.
    pub async fn acquire(&self, resource_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            locks
                .entry(resource_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Whether a resource's lock is currently held.
    pub fn is_locked(&self, resource_id: &str) -> bool {
        self.locks
            .lock()
            .get(resource_id)
            .is_some_and(|l| l.try_lock().is_err())
    }

    /// Execute `operations` atomically.
    ///
    /// Locks for the batch's unique resource ids are taken in lexicographic
    /// order; operations run in input order. If operation `k` fails, the
    /// rollbacks of operations `0..k` run in reverse and the original error
    /// is returned. Rollback failures are logged, not propagated.
    pub async fn execute_atomic<T: Send + 'static>(
        &self,
        operations: Vec<AtomicOperation<T>>,
    ) -> anyhow::Result<Vec<T>> {
        let mut resource_ids: Vec<String> = operations
            .iter()
            .map(|op| op.resource_id.clone())
            .collect();
        resource_ids.sort();
        resource_ids.dedup();

        let mut guards = Vec::with_capacity(resource_ids.len());
        for resource_id in &resource_ids {
            guards.push(self.acquire(resource_id).await);
        }

        let mut results = Vec::with_capacity(operations.len());
        let mut completed: Vec<(String, Option<RollbackFn>)> = Vec::new();

        for op in operations {
            let AtomicOperation {
                resource_id,
                operation,
                rollback,
            } = op;

            match operation().await {
                Ok(value) => {
                    results.push(value);
                    completed.push((resource_id, rollback));
                }
                Err(e) => {
                    warn!(
                        "atomic execution failed on {}, rolling back: {}",
                        resource_id, e
                    );
                    for (rolled_id, rollback) in completed.into_iter().rev() {
                        let Some(rollback) = rollback else { continue };
                        if let Err(rb_err) = rollback().await {
                            error!("rollback failed for {}: {}", rolled_id, rb_err);
                        }
                    }
                    return Err(e);
                }
            }
        }

        Ok(results)
    }
}

impl Default for ResourceLockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_execute_atomic_runs_in_input_order() {
        let manager = ResourceLockManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let ops = ["zebra", "apple", "mango"]
            .iter()
            .map(|&name| {
                let order = Arc::clone(&order);
                AtomicOperation::new(name, move || async move {
                    order.lock().push(name);
                    Ok(name)
                })
            })
            .collect();

        let results = manager.execute_atomic(ops).await.unwrap();
        assert_eq!(results, vec!["zebra", "apple", "mango"]);
        assert_eq!(*order.lock(), vec!["zebra", "apple", "mango"]);
    }

    #[tokio::test]
    async fn test_rollback_in_reverse_order() {
        let manager = ResourceLockManager::new();
        let rollbacks = Arc::new(Mutex::new(Vec::new()));

        let mut ops = Vec::new();
        for name in ["first", "second"] {
            let rollbacks = Arc::clone(&rollbacks);
            ops.push(
                AtomicOperation::new(name, move || async move { Ok(()) }).with_rollback(
                    move || async move {
                        rollbacks.lock().push(name);
                        Ok(())
                    },
                ),
            );
        }
        ops.push(AtomicOperation::new("third", || async {
            anyhow::bail!("boom")
        }));

        let err = manager.execute_atomic(ops).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(*rollbacks.lock(), vec!["second", "first"]);
    }

    #[tokio::test]
    async fn test_no_locks_held_after_execution() {
        let manager = ResourceLockManager::new();

        let ops = vec![AtomicOperation::new("res", || async { Ok(1) })];
        manager.execute_atomic(ops).await.unwrap();
        assert!(!manager.is_locked("res"));

        let ops = vec![AtomicOperation::new("res", || async {
            anyhow::bail!("fail")
        })];
        let _: anyhow::Result<Vec<i32>> = manager.execute_atomic(ops).await;
        assert!(!manager.is_locked("res"));
    }

    #[tokio::test]
    async fn test_duplicate_resource_ids_lock_once() {
        let manager = ResourceLockManager::new();
        // Two ops on the same resource: a double-acquire would deadlock.
        let ops = vec![
            AtomicOperation::new("same", || async { Ok(1) }),
            AtomicOperation::new("same", || async { Ok(2) }),
        ];
        let results = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            manager.execute_atomic(ops),
        )
        .await
        .expect("deadlocked on duplicate resource ids")
        .unwrap();
        assert_eq!(results, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_serialization_under_same_lock() {
        let manager = Arc::new(ResourceLockManager::new());
        let counter = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            let counter = Arc::clone(&counter);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _guard = manager.acquire("shared").await;
                let current = counter.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                counter.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rollback_failure_does_not_mask_error() {
        let manager = ResourceLockManager::new();
        let ops = vec![
            AtomicOperation::new("a", || async { Ok(()) })
                .with_rollback(|| async { anyhow::bail!("rollback broke") }),
            AtomicOperation::new("b", || async { anyhow::bail!("original") }),
        ];
        let err = manager.execute_atomic(ops).await.unwrap_err();
        assert_eq!(err.to_string(), "original");
    }
}
