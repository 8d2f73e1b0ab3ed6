// Capacity estimation port.
//
// The real estimator is an external collaborator; providers only see this
// seam. Given the pool's bounds and the current capacity picture it answers
// how much capacity to add right now.

use async_trait::async_trait;

use crate::shared_kernel::Result;

/// Inputs to one estimate.
#[derive(Debug, Clone, Copy)]
pub struct EstimateRequest {
    pub min_capacity: u32,
    pub max_capacity: u32,
    pub existing_capacity: u32,
    pub requested_capacity: u32,
}

#[async_trait]
pub trait CapacityEstimator: Send + Sync {
    /// Capacity units to spawn now. Zero means the pool is satisfied.
    async fn to_spawn(&self, request: EstimateRequest) -> Result<u32>;
}
