// ABOUTME: Remote task dispatch seam and worker operation registration cache
// ABOUTME: Verifies operations are deployed on their target worker before dispatching

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use super::error::TaskError;
use super::task::RemoteInvocation;

/// Handle resolving to the terminal result of a dispatched remote task.
pub type RemoteResultFuture = BoxFuture<'static, Result<Value, TaskError>>;

/// Transport seam for remote task execution. Implementations queue the
/// invocation on the target worker and report which operations that worker
/// has registered.
#[async_trait]
pub trait WorkerGateway: Send + Sync {
    /// Query the live set of operation names registered on a worker target.
    async fn registered_operations(&self, target: &str) -> Result<HashSet<String>, TaskError>;

    /// Dispatch an invocation to its target worker, returning a handle that
    /// resolves when the worker reports a terminal result.
    async fn dispatch(
        &self,
        invocation: &RemoteInvocation,
        task_id: &str,
    ) -> Result<RemoteResultFuture, TaskError>;
}

/// Cache of worker-target -> registered operation names.
///
/// Registration queries are network round-trips, so dispatch consults the
/// cache first and refreshes it once on a miss before declaring the operation
/// absent. Concurrent branches share one cache; last writer wins per target
/// and staleness is bounded by the refresh-on-miss behavior.
#[derive(Clone, Default)]
pub struct RegistrationCache {
    inner: Arc<RwLock<HashMap<String, HashSet<String>>>>,
}

impl RegistrationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, target: &str, operation: &str) -> bool {
        let cache = self.inner.read().await;
        cache
            .get(target)
            .map(|ops| ops.contains(operation))
            .unwrap_or(false)
    }

    pub async fn replace(&self, target: &str, operations: HashSet<String>) {
        let mut cache = self.inner.write().await;
        cache.insert(target.to_string(), operations);
    }

    /// Verify an operation is registered on its target worker, refreshing the
    /// cached set via one live query on a miss. A truly-missing operation is
    /// a deployment defect and classified non-recoverable.
    pub async fn verify_registered(
        &self,
        gateway: &Arc<dyn WorkerGateway>,
        invocation: &RemoteInvocation,
    ) -> Result<(), TaskError> {
        if self.contains(&invocation.target, &invocation.operation).await {
            return Ok(());
        }

        debug!(
            target = %invocation.target,
            operation = %invocation.operation,
            "registration cache miss, querying worker"
        );
        let registered = gateway.registered_operations(&invocation.target).await?;
        let found = registered.contains(&invocation.operation);
        self.replace(&invocation.target, registered).await;

        if found {
            Ok(())
        } else {
            Err(TaskError::non_recoverable(format!(
                "operation {} is not registered on worker {}",
                invocation.operation, invocation.target
            )))
        }
    }
}
