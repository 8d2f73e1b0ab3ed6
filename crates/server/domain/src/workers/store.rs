// Persistence ports for workers and worker pools.
//
// `update` is a read-modify-write under a row-scoped transaction:
// implementations must serialise concurrent updates on the same row and
// return the post-mutation record. Pipeline code persists progress through
// these ports before issuing the next cloud call that depends on it.

use async_trait::async_trait;

use crate::shared_kernel::{Result, WorkerKey, WorkerPoolId};
use crate::workers::aggregate::{Worker, WorkerPool};

/// Mutation applied inside a row-scoped transaction.
pub type WorkerMutator = Box<dyn FnOnce(&mut Worker) + Send>;
pub type WorkerPoolMutator = Box<dyn FnOnce(&mut WorkerPool) + Send>;

#[async_trait]
pub trait WorkerStore: Send + Sync {
    /// Insert a new worker row. Fails if the key already exists.
    async fn create(&self, worker: Worker) -> Result<Worker>;

    async fn get(&self, key: &WorkerKey) -> Result<Option<Worker>>;

    /// Read-modify-write one row; concurrent updates on the same row
    /// serialise. Returns the updated record.
    async fn update(&self, key: &WorkerKey, mutator: WorkerMutator) -> Result<Worker>;

    async fn list_by_pool(&self, worker_pool_id: &WorkerPoolId) -> Result<Vec<Worker>>;

    async fn list_all(&self) -> Result<Vec<Worker>>;

    /// Remove the row entirely (post-expiry reaping).
    async fn delete(&self, key: &WorkerKey) -> Result<()>;
}

#[async_trait]
pub trait WorkerPoolStore: Send + Sync {
    async fn create(&self, pool: WorkerPool) -> Result<WorkerPool>;

    async fn get(&self, worker_pool_id: &WorkerPoolId) -> Result<Option<WorkerPool>>;

    async fn update(
        &self,
        worker_pool_id: &WorkerPoolId,
        mutator: WorkerPoolMutator,
    ) -> Result<WorkerPool>;

    async fn list(&self) -> Result<Vec<WorkerPool>>;

    async fn delete(&self, worker_pool_id: &WorkerPoolId) -> Result<()>;
}
