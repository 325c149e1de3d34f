//! Conflict detection and resolution for concurrent operations
//!
//! Certain operation types must not interleave (reconfiguring the network
//! while restarting it, two IP allocations, a join racing a leave). Given
//! two operations this resolver picks a strategy: serialize them under the
//! resource lock, run only the higher-priority one, or abort the pair.

use crate::locks::{AtomicOperation, ResourceLockManager};
use crate::tasks::TaskPriority;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConflictError {
    #[error("conflicting operations aborted: {first} vs {second}")]
    Aborted { first: String, second: String },
    #[error("execution failed: {0}")]
    Execution(String),
}

/// How a pair of operations is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStrategy {
    /// Serialize under the shared resource lock
    Queue,
    /// Refuse to run either
    Abort,
    /// Run only the higher-priority operation
    Prioritize,
    /// Combine both into one operation (reserved; no current pair merges)
    Merge,
}

/// Operation types that must not interleave with each other
fn conflicts_of(operation_type: &str) -> &'static [&'static str] {
    match operation_type {
        "configure_network" => &["configure_network", "restart_network"],
        "restart_network" => &["configure_network", "restart_network"],
        "allocate_ip" => &["allocate_ip"],
        "join_party" => &["leave_party"],
        "leave_party" => &["join_party"],
        _ => &[],
    }
}

/// Whether two operation types conflict.
pub fn has_conflict(first: &str, second: &str) -> bool {
    conflicts_of(first).contains(&second)
}

/// An operation with the metadata conflict resolution needs
pub struct OperationSpec<T> {
    pub resource_id: String,
    pub operation_type: String,
    pub priority: TaskPriority,
    operation: AtomicOperation<T>,
}

impl<T: Send + 'static> OperationSpec<T> {
    pub fn new<F, Fut>(
        resource_id: impl Into<String>,
        operation_type: impl Into<String>,
        priority: TaskPriority,
        operation: F,
    ) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let resource_id = resource_id.into();
        Self {
            operation: AtomicOperation::new(resource_id.clone(), operation),
            resource_id,
            operation_type: operation_type.into(),
            priority,
        }
    }

    pub fn with_rollback<F, Fut>(mut self, rollback: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.operation = self.operation.with_rollback(rollback);
        self
    }
}

/// Detects and resolves operation conflicts on top of the lock manager.
pub struct ConflictResolver {
    locks: Arc<ResourceLockManager>,
}

impl ConflictResolver {
    pub fn new(locks: Arc<ResourceLockManager>) -> Self {
        Self { locks }
    }

    /// Choose the strategy for a pair of operations.
    pub fn resolve_strategy<T>(
        &self,
        first: &OperationSpec<T>,
        second: &OperationSpec<T>,
    ) -> ResolutionStrategy {
        if !has_conflict(&first.operation_type, &second.operation_type) {
            return ResolutionStrategy::Queue;
        }
        if first.operation_type == second.operation_type {
            if first.priority != second.priority {
                return ResolutionStrategy::Prioritize;
            }
            return ResolutionStrategy::Queue;
        }
        if first.priority != second.priority {
            return ResolutionStrategy::Prioritize;
        }
        ResolutionStrategy::Abort
    }

    /// Resolve and execute a pair of operations. Returns the results of the
    /// operations that actually ran, in execution order.
    pub async fn resolve_pair<T: Send + 'static>(
        &self,
        first: OperationSpec<T>,
        second: OperationSpec<T>,
    ) -> Result<Vec<T>, ConflictError> {
        let strategy = self.resolve_strategy(&first, &second);
        if strategy != ResolutionStrategy::Queue {
            warn!(
                "conflict resolution strategy {:?} for {} vs {} on {}",
                strategy, first.operation_type, second.operation_type, first.resource_id
            );
        }

        match strategy {
            ResolutionStrategy::Abort => Err(ConflictError::Aborted {
                first: first.operation_type,
                second: second.operation_type,
            }),
            ResolutionStrategy::Prioritize => {
                let chosen = if first.priority >= second.priority {
                    first
                } else {
                    second
                };
                self.locks
                    .execute_atomic(vec![chosen.operation])
                    .await
                    .map_err(|e| ConflictError::Execution(e.to_string()))
            }
            // Queue (and the reserved Merge) serialize under the lock
            // manager in submission order.
            ResolutionStrategy::Queue | ResolutionStrategy::Merge => self
                .locks
                .execute_atomic(vec![first.operation, second.operation])
                .await
                .map_err(|e| ConflictError::Execution(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(
        operation_type: &str,
        priority: TaskPriority,
        value: i32,
    ) -> OperationSpec<i32> {
        OperationSpec::new("net0", operation_type, priority, move || async move {
            Ok(value)
        })
    }

    fn resolver() -> ConflictResolver {
        ConflictResolver::new(Arc::new(ResourceLockManager::new()))
    }

    #[test]
    fn test_conflict_table() {
        assert!(has_conflict("configure_network", "restart_network"));
        assert!(has_conflict("restart_network", "configure_network"));
        assert!(has_conflict("configure_network", "configure_network"));
        assert!(has_conflict("allocate_ip", "allocate_ip"));
        assert!(has_conflict("join_party", "leave_party"));
        assert!(has_conflict("leave_party", "join_party"));
        assert!(!has_conflict("join_party", "join_party"));
        assert!(!has_conflict("configure_network", "allocate_ip"));
        assert!(!has_conflict("unknown_op", "configure_network"));
    }

    #[test]
    fn test_non_conflicting_queue() {
        let r = resolver();
        let a = spec("allocate_ip", TaskPriority::Normal, 1);
        let b = spec("configure_network", TaskPriority::Normal, 2);
        assert_eq!(r.resolve_strategy(&a, &b), ResolutionStrategy::Queue);
    }

    #[test]
    fn test_same_type_equal_priority_queue() {
        let r = resolver();
        let a = spec("allocate_ip", TaskPriority::Normal, 1);
        let b = spec("allocate_ip", TaskPriority::Normal, 2);
        assert_eq!(r.resolve_strategy(&a, &b), ResolutionStrategy::Queue);
    }

    #[test]
    fn test_differing_priority_prioritizes() {
        let r = resolver();
        let a = spec("allocate_ip", TaskPriority::High, 1);
        let b = spec("allocate_ip", TaskPriority::Low, 2);
        assert_eq!(r.resolve_strategy(&a, &b), ResolutionStrategy::Prioritize);

        let c = spec("configure_network", TaskPriority::Critical, 1);
        let d = spec("restart_network", TaskPriority::Normal, 2);
        assert_eq!(r.resolve_strategy(&c, &d), ResolutionStrategy::Prioritize);
    }

    #[test]
    fn test_conflicting_types_equal_priority_abort() {
        let r = resolver();
        let a = spec("configure_network", TaskPriority::Normal, 1);
        let b = spec("restart_network", TaskPriority::Normal, 2);
        assert_eq!(r.resolve_strategy(&a, &b), ResolutionStrategy::Abort);
    }

    #[tokio::test]
    async fn test_resolve_pair_queue_runs_both() {
        let r = resolver();
        let a = spec("allocate_ip", TaskPriority::Normal, 1);
        let b = spec("allocate_ip", TaskPriority::Normal, 2);
        let results = r.resolve_pair(a, b).await.unwrap();
        assert_eq!(results, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_resolve_pair_prioritize_runs_winner_only() {
        let r = resolver();
        let low = spec("allocate_ip", TaskPriority::Low, 1);
        let high = spec("allocate_ip", TaskPriority::High, 2);
        let results = r.resolve_pair(low, high).await.unwrap();
        assert_eq!(results, vec![2]);
    }

    #[tokio::test]
    async fn test_resolve_pair_abort_fails() {
        let r = resolver();
        let a = spec("configure_network", TaskPriority::Normal, 1);
        let b = spec("restart_network", TaskPriority::Normal, 2);
        assert!(matches!(
            r.resolve_pair(a, b).await,
            Err(ConflictError::Aborted { .. })
        ));
    }
}
