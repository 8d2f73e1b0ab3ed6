//! Default capacity estimation.
//!
//! The production estimator is an external service; this module supplies
//! the in-process default and the port for external demand input.

use async_trait::async_trait;

use cirrus_server_domain::shared_kernel::{Result, WorkerPoolId};
use cirrus_server_domain::workers::{CapacityEstimator, EstimateRequest};

/// Clamp-and-subtract estimator.
///
/// Desired capacity is the requested demand clamped into the pool's
/// `[min, max]` bounds; whatever already exists counts against it.
#[derive(Debug, Clone, Default)]
pub struct SimpleEstimator;

impl SimpleEstimator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CapacityEstimator for SimpleEstimator {
    async fn to_spawn(&self, request: EstimateRequest) -> Result<u32> {
        let desired = request
            .requested_capacity
            .clamp(request.min_capacity, request.max_capacity.max(request.min_capacity));
        Ok(desired.saturating_sub(request.existing_capacity))
    }
}

/// Source of requested capacity for a pool.
///
/// The real implementation asks the task queue how much work is pending;
/// that integration is outside this repository.
#[async_trait]
pub trait DemandSource: Send + Sync {
    async fn requested_capacity(&self, worker_pool_id: &WorkerPoolId) -> Result<u32>;
}

/// Fixed demand for every pool. `StaticDemand::none()` makes pools run at
/// their configured minimum.
#[derive(Debug, Clone, Default)]
pub struct StaticDemand {
    requested: u32,
}

impl StaticDemand {
    pub fn new(requested: u32) -> Self {
        Self { requested }
    }

    pub fn none() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DemandSource for StaticDemand {
    async fn requested_capacity(&self, _worker_pool_id: &WorkerPoolId) -> Result<u32> {
        Ok(self.requested)
    }
}
