//! Loop behavior against stub ports: capacity accounting in the
//! provisioning pass, per-worker error isolation in the scan pass, and
//! reaping of expired terminal rows.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;

use cirrus_server_application::workers::provisioning::{ProvisioningConfig, ProvisioningService};
use cirrus_server_application::workers::scanner::{ScannerConfig, WorkerScanner};
use cirrus_server_application::StaticDemand;
use cirrus_server_domain::shared_kernel::{DomainError, Result, WorkerKey, WorkerPoolId};
use cirrus_server_domain::workers::pool_config::WorkerPoolConfig;
use cirrus_server_domain::workers::provider_api::{
    IdentityProof, PoolDemand, ProviderError, ProviderResult, RegistrationOutcome, WorkerProvider,
};
use cirrus_server_domain::workers::provider_data::{
    AzureWorkerData, ProviderData, ResourceRecord, VmRecord,
};
use cirrus_server_domain::workers::store::{
    WorkerMutator, WorkerPoolMutator, WorkerPoolStore, WorkerStore,
};
use cirrus_server_domain::workers::{Worker, WorkerPool};
use cirrus_shared::WorkerState;

// Test-only stores, kept deliberately simple: a single mutex over the
// whole map is plenty at test scale.

#[derive(Default)]
struct StubWorkerStore {
    rows: Mutex<HashMap<WorkerKey, Worker>>,
}

#[async_trait]
impl WorkerStore for StubWorkerStore {
    async fn create(&self, worker: Worker) -> Result<Worker> {
        self.rows
            .lock()
            .unwrap()
            .insert(worker.key(), worker.clone());
        Ok(worker)
    }

    async fn get(&self, key: &WorkerKey) -> Result<Option<Worker>> {
        Ok(self.rows.lock().unwrap().get(key).cloned())
    }

    async fn update(&self, key: &WorkerKey, mutator: WorkerMutator) -> Result<Worker> {
        let mut rows = self.rows.lock().unwrap();
        let worker = rows.get_mut(key).ok_or(DomainError::WorkerNotFound {
            key: key.clone(),
        })?;
        mutator(worker);
        Ok(worker.clone())
    }

    async fn list_by_pool(&self, worker_pool_id: &WorkerPoolId) -> Result<Vec<Worker>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|w| &w.worker_pool_id == worker_pool_id)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<Worker>> {
        Ok(self.rows.lock().unwrap().values().cloned().collect())
    }

    async fn delete(&self, key: &WorkerKey) -> Result<()> {
        self.rows.lock().unwrap().remove(key);
        Ok(())
    }
}

#[derive(Default)]
struct StubPoolStore {
    rows: Mutex<HashMap<WorkerPoolId, WorkerPool>>,
}

#[async_trait]
impl WorkerPoolStore for StubPoolStore {
    async fn create(&self, pool: WorkerPool) -> Result<WorkerPool> {
        self.rows
            .lock()
            .unwrap()
            .insert(pool.worker_pool_id.clone(), pool.clone());
        Ok(pool)
    }

    async fn get(&self, worker_pool_id: &WorkerPoolId) -> Result<Option<WorkerPool>> {
        Ok(self.rows.lock().unwrap().get(worker_pool_id).cloned())
    }

    async fn update(
        &self,
        worker_pool_id: &WorkerPoolId,
        mutator: WorkerPoolMutator,
    ) -> Result<WorkerPool> {
        let mut rows = self.rows.lock().unwrap();
        let pool = rows
            .get_mut(worker_pool_id)
            .ok_or_else(|| DomainError::WorkerPoolNotFound {
                worker_pool_id: worker_pool_id.clone(),
            })?;
        mutator(pool);
        Ok(pool.clone())
    }

    async fn list(&self) -> Result<Vec<WorkerPool>> {
        Ok(self.rows.lock().unwrap().values().cloned().collect())
    }

    async fn delete(&self, worker_pool_id: &WorkerPoolId) -> Result<()> {
        self.rows.lock().unwrap().remove(worker_pool_id);
        Ok(())
    }
}

/// Provider stub that records what the loops hand it.
#[derive(Default)]
struct StubProvider {
    id: String,
    demands: Mutex<Vec<PoolDemand>>,
    checked: Mutex<Vec<WorkerKey>>,
    deprovisioned: AtomicU64,
    prepares: AtomicU64,
    cleanups: AtomicU64,
    /// Worker ids whose check should fail
    failing: Vec<String>,
}

impl StubProvider {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl WorkerProvider for StubProvider {
    fn provider_id(&self) -> &str {
        &self.id
    }

    async fn setup(&self) -> ProviderResult<()> {
        Ok(())
    }

    async fn provision(&self, _pool: &WorkerPool, demand: &PoolDemand) -> ProviderResult<()> {
        self.demands.lock().unwrap().push(*demand);
        Ok(())
    }

    async fn deprovision(&self, _pool: &WorkerPool) -> ProviderResult<()> {
        self.deprovisioned.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn register_worker(
        &self,
        _pool: &WorkerPool,
        _worker: &Worker,
        _proof: &IdentityProof,
    ) -> ProviderResult<RegistrationOutcome> {
        Err(ProviderError::SignatureValidation)
    }

    async fn scan_prepare(&self) -> ProviderResult<()> {
        self.prepares.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn check_worker(&self, worker: &Worker) -> ProviderResult<()> {
        if self.failing.contains(&worker.worker_id) {
            return Err(ProviderError::Cloud {
                message: "synthetic failure".to_string(),
            });
        }
        self.checked.lock().unwrap().push(worker.key());
        Ok(())
    }

    async fn scan_cleanup(&self) -> ProviderResult<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove_worker(&self, _worker: &Worker, _reason: &str) -> ProviderResult<()> {
        Ok(())
    }
}

fn pool(id: &str, provider: &str) -> WorkerPool {
    WorkerPool::new(
        WorkerPoolId::new(id).unwrap(),
        provider,
        "owner@example.com",
        WorkerPoolConfig {
            min_capacity: 0,
            max_capacity: 10,
            lifecycle: Default::default(),
            launch_configs: Vec::new(),
        },
        Utc::now(),
    )
}

fn worker(pool_id: &str, worker_id: &str, state: WorkerState, capacity: u32) -> Worker {
    let now = Utc::now();
    let mut worker = Worker::new(
        WorkerPoolId::new(pool_id).unwrap(),
        "azure-central",
        "westus",
        worker_id,
        capacity,
        now + Duration::days(7),
        ProviderData::Azure(AzureWorkerData {
            location: "westus".to_string(),
            resource_group_name: "rg".to_string(),
            subnet_id: "subnet".to_string(),
            tags: HashMap::new(),
            vm: VmRecord {
                resource: ResourceRecord::new(worker_id),
                computer_name: "host".to_string(),
                config: json!({}),
                vm_id: None,
            },
            ip: ResourceRecord::new("pip-x"),
            nic: ResourceRecord::new("nic-x"),
            disks: Vec::new(),
            disk: None,
            terminate_after: None,
            reregistration_timeout: None,
            worker_config: json!({}),
        }),
        now,
    )
    .unwrap();

    match state {
        WorkerState::Requested => {}
        WorkerState::Stopped => {
            worker.set_state(WorkerState::Stopping, now).unwrap();
            worker.set_state(WorkerState::Stopped, now).unwrap();
        }
        other => worker.set_state(other, now).unwrap(),
    }
    worker
}

#[tokio::test]
async fn test_provisioning_counts_live_capacity_only() {
    let pools = Arc::new(StubPoolStore::default());
    let workers = Arc::new(StubWorkerStore::default());
    let provider = Arc::new(StubProvider::new("azure-central"));

    pools.create(pool("builds/linux", "azure-central")).await.unwrap();
    workers
        .create(worker("builds/linux", "vm-a", WorkerState::Requested, 2))
        .await
        .unwrap();
    workers
        .create(worker("builds/linux", "vm-b", WorkerState::Running, 3))
        .await
        .unwrap();
    workers
        .create(worker("builds/linux", "vm-c", WorkerState::Stopping, 4))
        .await
        .unwrap();
    workers
        .create(worker("builds/linux", "vm-d", WorkerState::Stopped, 5))
        .await
        .unwrap();

    let mut providers: HashMap<String, Arc<dyn WorkerProvider>> = HashMap::new();
    providers.insert("azure-central".to_string(), provider.clone());

    let service = ProvisioningService::new(
        pools,
        workers,
        providers,
        Arc::new(StaticDemand::new(7)),
        ProvisioningConfig::default(),
    );

    let summary = service.run_once().await.unwrap();
    assert_eq!(summary.pools_provisioned, 1);
    assert_eq!(summary.failures, 0);

    let demands = provider.demands.lock().unwrap();
    assert_eq!(demands.len(), 1);
    // requested (2) + running (3); stopping and stopped never count
    assert_eq!(demands[0].existing_capacity, 5);
    assert_eq!(demands[0].requested_capacity, 7);
}

#[tokio::test]
async fn test_null_provider_pool_is_deprovisioned() {
    let pools = Arc::new(StubPoolStore::default());
    let workers = Arc::new(StubWorkerStore::default());
    let provider = Arc::new(StubProvider::new("azure-central"));

    let mut dying = pool("builds/linux", "azure-central");
    dying.schedule_for_deletion(Utc::now());
    pools.create(dying).await.unwrap();

    let mut providers: HashMap<String, Arc<dyn WorkerProvider>> = HashMap::new();
    providers.insert("azure-central".to_string(), provider.clone());

    let service = ProvisioningService::new(
        pools,
        workers,
        providers,
        Arc::new(StaticDemand::none()),
        ProvisioningConfig::default(),
    );

    let summary = service.run_once().await.unwrap();
    assert_eq!(summary.pools_deprovisioned, 1);
    assert_eq!(provider.deprovisioned.load(Ordering::SeqCst), 1);
    assert!(provider.demands.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_scan_pass_isolates_failures_and_reaps_expired() {
    let workers = Arc::new(StubWorkerStore::default());
    let provider = Arc::new(StubProvider {
        failing: vec!["vm-bad".to_string()],
        ..StubProvider::new("azure-central")
    });

    workers
        .create(worker("builds/linux", "vm-good", WorkerState::Running, 1))
        .await
        .unwrap();
    workers
        .create(worker("builds/linux", "vm-bad", WorkerState::Running, 1))
        .await
        .unwrap();
    workers
        .create(worker("builds/linux", "vm-other", WorkerState::Requested, 1))
        .await
        .unwrap();

    // an expired stopped row gets reaped, a fresh one lingers
    let mut expired = worker("builds/linux", "vm-expired", WorkerState::Stopped, 1);
    expired.expires = Utc::now() - Duration::hours(1);
    workers.create(expired).await.unwrap();
    workers
        .create(worker("builds/linux", "vm-stopped", WorkerState::Stopped, 1))
        .await
        .unwrap();

    let mut providers: HashMap<String, Arc<dyn WorkerProvider>> = HashMap::new();
    providers.insert("azure-central".to_string(), provider.clone());

    let scanner = WorkerScanner::new(workers.clone(), providers, ScannerConfig::default());
    let summary = scanner.run_once().await.unwrap();

    assert_eq!(summary.workers_checked, 2);
    assert_eq!(summary.failures, 1);
    assert_eq!(summary.workers_reaped, 1);
    assert_eq!(summary.workers_skipped, 1);

    assert_eq!(provider.prepares.load(Ordering::SeqCst), 1);
    assert_eq!(provider.cleanups.load(Ordering::SeqCst), 1);

    // the bad worker did not stop the others
    let checked = provider.checked.lock().unwrap();
    assert_eq!(checked.len(), 2);

    // the expired stopped row is gone, the fresh one remains
    let remaining = workers.list_all().await.unwrap();
    assert!(!remaining.iter().any(|w| w.worker_id == "vm-expired"));
    assert!(remaining.iter().any(|w| w.worker_id == "vm-stopped"));
}
