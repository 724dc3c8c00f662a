//! Worker pool contract.
//!
//! The bridge never runs business logic itself; it hands every call to a
//! [`Pool`]. Pools can be reset (all workers replaced) or destroyed while
//! traffic is flowing, so every proxy reaches the pool through a
//! [`GuardedPool`]: a shared handle plus one reader/writer lock common to all
//! proxies. Executions hold the lock for reading, lifecycle operations hold it
//! for writing, so the two never overlap.

use crate::{Payload, PoolError};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Identity of one worker in a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub index: usize,
    pub pid: Option<u32>,
}

/// An external pool of workers that executes payloads.
///
/// `exec` may be cancelled by dropping its future; implementations must treat
/// that as the caller giving up on the request.
#[tonic::async_trait]
pub trait Pool: Send + Sync + 'static {
    /// Runs one request and returns the worker's response.
    async fn exec(&self, payload: &Payload) -> Result<Payload, PoolError>;

    /// Replaces every worker with a fresh one.
    async fn reset(&self) -> Result<(), PoolError>;

    /// Stops every worker, letting in-progress work complete.
    async fn destroy(&self);

    /// Workers currently owned by the pool.
    fn workers(&self) -> Vec<WorkerInfo>;
}

/// A [`Pool`] shared between proxies together with the lock that serializes
/// its lifecycle against executions.
#[derive(Clone)]
pub struct GuardedPool {
    pool: Arc<dyn Pool>,
    guard: Arc<RwLock<()>>,
}

impl GuardedPool {
    pub fn new(pool: Arc<dyn Pool>) -> Self {
        Self {
            pool,
            guard: Arc::new(RwLock::new(())),
        }
    }

    /// Executes under the shared read lock. The lock is held only for the
    /// duration of the pool call.
    pub async fn exec(&self, payload: &Payload) -> Result<Payload, PoolError> {
        let _read = self.guard.read().await;
        self.pool.exec(payload).await
    }

    /// Resets the pool once every in-flight execution has finished. New
    /// executions wait until the reset completes.
    pub async fn reset(&self) -> Result<(), PoolError> {
        let _write = self.guard.write().await;
        self.pool.reset().await
    }

    /// Destroys the pool once every in-flight execution has finished.
    pub async fn destroy(&self) {
        let _write = self.guard.write().await;
        self.pool.destroy().await;
    }

    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.pool.workers()
    }

    pub fn shares_guard_with(&self, other: &GuardedPool) -> bool {
        Arc::ptr_eq(&self.guard, &other.guard)
    }
}
