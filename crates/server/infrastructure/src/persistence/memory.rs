//! In-memory worker and pool stores.
//!
//! The real database is an external collaborator; these stores satisfy the
//! persistence ports for the daemon and for every test. The contract that
//! matters is row-scoped serialisation: each record sits behind its own
//! `tokio::sync::Mutex`, so concurrent `update`s on the same row queue up
//! while updates on different rows proceed in parallel.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use cirrus_server_domain::shared_kernel::{DomainError, Result, WorkerKey, WorkerPoolId};
use cirrus_server_domain::workers::store::{
    WorkerMutator, WorkerPoolMutator, WorkerPoolStore, WorkerStore,
};
use cirrus_server_domain::workers::{Worker, WorkerPool};

/// In-memory [`WorkerStore`].
#[derive(Clone, Default)]
pub struct InMemoryWorkerStore {
    rows: Arc<RwLock<HashMap<WorkerKey, Arc<Mutex<Worker>>>>>,
}

impl InMemoryWorkerStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn row(&self, key: &WorkerKey) -> Option<Arc<Mutex<Worker>>> {
        self.rows.read().await.get(key).cloned()
    }
}

#[async_trait]
impl WorkerStore for InMemoryWorkerStore {
    async fn create(&self, worker: Worker) -> Result<Worker> {
        let key = worker.key();
        let mut rows = self.rows.write().await;
        if rows.contains_key(&key) {
            return Err(DomainError::WorkerAlreadyExists { key });
        }
        rows.insert(key, Arc::new(Mutex::new(worker.clone())));
        Ok(worker)
    }

    async fn get(&self, key: &WorkerKey) -> Result<Option<Worker>> {
        match self.row(key).await {
            Some(row) => Ok(Some(row.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn update(&self, key: &WorkerKey, mutator: WorkerMutator) -> Result<Worker> {
        let row = self.row(key).await.ok_or(DomainError::WorkerNotFound {
            key: key.clone(),
        })?;
        let mut worker = row.lock().await;
        mutator(&mut worker);
        Ok(worker.clone())
    }

    async fn list_by_pool(&self, worker_pool_id: &WorkerPoolId) -> Result<Vec<Worker>> {
        let rows = self.rows.read().await;
        let mut workers = Vec::new();
        for (key, row) in rows.iter() {
            if &key.worker_pool_id == worker_pool_id {
                workers.push(row.lock().await.clone());
            }
        }
        Ok(workers)
    }

    async fn list_all(&self) -> Result<Vec<Worker>> {
        let rows = self.rows.read().await;
        let mut workers = Vec::with_capacity(rows.len());
        for row in rows.values() {
            workers.push(row.lock().await.clone());
        }
        Ok(workers)
    }

    async fn delete(&self, key: &WorkerKey) -> Result<()> {
        self.rows.write().await.remove(key);
        Ok(())
    }
}

/// In-memory [`WorkerPoolStore`].
#[derive(Clone, Default)]
pub struct InMemoryWorkerPoolStore {
    rows: Arc<RwLock<HashMap<WorkerPoolId, Arc<Mutex<WorkerPool>>>>>,
}

impl InMemoryWorkerPoolStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkerPoolStore for InMemoryWorkerPoolStore {
    async fn create(&self, pool: WorkerPool) -> Result<WorkerPool> {
        let id = pool.worker_pool_id.clone();
        let mut rows = self.rows.write().await;
        if rows.contains_key(&id) {
            return Err(DomainError::WorkerPoolAlreadyExists { worker_pool_id: id });
        }
        rows.insert(id, Arc::new(Mutex::new(pool.clone())));
        Ok(pool)
    }

    async fn get(&self, worker_pool_id: &WorkerPoolId) -> Result<Option<WorkerPool>> {
        match self.rows.read().await.get(worker_pool_id).cloned() {
            Some(row) => Ok(Some(row.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn update(
        &self,
        worker_pool_id: &WorkerPoolId,
        mutator: WorkerPoolMutator,
    ) -> Result<WorkerPool> {
        let row = self
            .rows
            .read()
            .await
            .get(worker_pool_id)
            .cloned()
            .ok_or_else(|| DomainError::WorkerPoolNotFound {
                worker_pool_id: worker_pool_id.clone(),
            })?;
        let mut pool = row.lock().await;
        mutator(&mut pool);
        Ok(pool.clone())
    }

    async fn list(&self) -> Result<Vec<WorkerPool>> {
        let rows = self.rows.read().await;
        let mut pools = Vec::with_capacity(rows.len());
        for row in rows.values() {
            pools.push(row.lock().await.clone());
        }
        Ok(pools)
    }

    async fn delete(&self, worker_pool_id: &WorkerPoolId) -> Result<()> {
        self.rows.write().await.remove(worker_pool_id);
        Ok(())
    }
}
