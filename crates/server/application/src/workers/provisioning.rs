//! Provisioning loop.
//!
//! Each tick walks every worker pool, computes the capacity picture, and
//! asks the pool's provider to cover the shortfall. Pools scheduled for
//! deletion (null provider) are handed to their previous providers for
//! deprovisioning instead. Work across pools runs with bounded fan-out;
//! one pool's failure never stops the pass.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use cirrus_server_domain::shared_kernel::{DomainError, WorkerState};
use cirrus_server_domain::workers::provider_api::{PoolDemand, WorkerProvider};
use cirrus_server_domain::workers::store::{WorkerPoolStore, WorkerStore};
use cirrus_server_domain::workers::WorkerPool;

use super::estimator::DemandSource;

/// Tuning for the provisioning loop.
#[derive(Debug, Clone)]
pub struct ProvisioningConfig {
    /// Interval between passes
    pub tick_interval: Duration,

    /// Bound on pools provisioned concurrently
    pub max_concurrency: usize,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            max_concurrency: 16,
        }
    }
}

/// Result of one provisioning pass.
#[derive(Debug, Default)]
pub struct ProvisionPassSummary {
    pub pools_provisioned: u64,
    pub pools_deprovisioned: u64,
    pub failures: u64,
}

pub struct ProvisioningService {
    pools: Arc<dyn WorkerPoolStore>,
    workers: Arc<dyn WorkerStore>,
    providers: HashMap<String, Arc<dyn WorkerProvider>>,
    demand: Arc<dyn DemandSource>,
    config: ProvisioningConfig,
}

impl ProvisioningService {
    pub fn new(
        pools: Arc<dyn WorkerPoolStore>,
        workers: Arc<dyn WorkerStore>,
        providers: HashMap<String, Arc<dyn WorkerProvider>>,
        demand: Arc<dyn DemandSource>,
        config: ProvisioningConfig,
    ) -> Self {
        Self {
            pools,
            workers,
            providers,
            demand,
            config,
        }
    }

    /// Run until `shutdown` flips to true. The in-flight pass finishes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_secs = self.config.tick_interval.as_secs(),
            "provisioning loop started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.tick_interval) => {
                    match self.run_once().await {
                        Ok(summary) => debug!(
                            provisioned = summary.pools_provisioned,
                            deprovisioned = summary.pools_deprovisioned,
                            failures = summary.failures,
                            "provisioning pass finished"
                        ),
                        Err(error) => error!(%error, "provisioning pass failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("provisioning loop stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One full pass over all pools.
    pub async fn run_once(&self) -> Result<ProvisionPassSummary, DomainError> {
        let pools = self.pools.list().await?;

        let provisioned = AtomicU64::new(0);
        let deprovisioned = AtomicU64::new(0);
        let failures = AtomicU64::new(0);

        futures::stream::iter(pools)
            .for_each_concurrent(self.config.max_concurrency, |pool| {
                let provisioned = &provisioned;
                let deprovisioned = &deprovisioned;
                let failures = &failures;
                async move {
                    if pool.is_scheduled_for_deletion() {
                        match self.deprovision_pool(&pool).await {
                            Ok(()) => deprovisioned.fetch_add(1, Ordering::Relaxed),
                            Err(()) => failures.fetch_add(1, Ordering::Relaxed),
                        };
                    } else {
                        match self.provision_pool(&pool).await {
                            Ok(()) => provisioned.fetch_add(1, Ordering::Relaxed),
                            Err(()) => failures.fetch_add(1, Ordering::Relaxed),
                        };
                    }
                }
            })
            .await;

        Ok(ProvisionPassSummary {
            pools_provisioned: provisioned.into_inner(),
            pools_deprovisioned: deprovisioned.into_inner(),
            failures: failures.into_inner(),
        })
    }

    async fn provision_pool(&self, pool: &WorkerPool) -> Result<(), ()> {
        let provider = match self.providers.get(&pool.provider_id) {
            Some(provider) => provider,
            None => {
                warn!(
                    worker_pool_id = %pool.worker_pool_id,
                    provider_id = %pool.provider_id,
                    "pool references an unknown provider"
                );
                return Err(());
            }
        };

        let demand = match self.pool_demand(pool).await {
            Ok(demand) => demand,
            Err(error) => {
                error!(
                    worker_pool_id = %pool.worker_pool_id,
                    %error,
                    "failed to compute pool demand"
                );
                return Err(());
            }
        };

        if let Err(error) = provider.provision(pool, &demand).await {
            error!(
                worker_pool_id = %pool.worker_pool_id,
                %error,
                "provisioning failed"
            );
            return Err(());
        }
        Ok(())
    }

    async fn deprovision_pool(&self, pool: &WorkerPool) -> Result<(), ()> {
        let mut ok = true;
        for provider_id in &pool.previous_provider_ids {
            if let Some(provider) = self.providers.get(provider_id) {
                if let Err(error) = provider.deprovision(pool).await {
                    error!(
                        worker_pool_id = %pool.worker_pool_id,
                        provider_id = %provider_id,
                        %error,
                        "deprovisioning failed"
                    );
                    ok = false;
                }
            }
        }
        if ok {
            Ok(())
        } else {
            Err(())
        }
    }

    async fn pool_demand(&self, pool: &WorkerPool) -> Result<PoolDemand, DomainError> {
        let workers = self.workers.list_by_pool(&pool.worker_pool_id).await?;
        let existing_capacity = workers
            .iter()
            .filter(|w| matches!(w.state, WorkerState::Requested | WorkerState::Running))
            .map(|w| w.capacity)
            .sum();
        let requested_capacity = self
            .demand
            .requested_capacity(&pool.worker_pool_id)
            .await?;
        Ok(PoolDemand {
            existing_capacity,
            requested_capacity,
        })
    }
}
