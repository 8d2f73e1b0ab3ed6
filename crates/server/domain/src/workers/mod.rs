// Workers bounded context
//
// - aggregate: Worker and WorkerPool entities
// - pool_config: persisted pool configuration (launch configs, lifecycle)
// - provider_data: per-provider mutable state carried on each worker
// - provider_api: the provider capability port
// - estimator: capacity estimation port
// - store: persistence ports

pub mod aggregate;
pub mod estimator;
pub mod pool_config;
pub mod provider_api;
pub mod provider_data;
pub mod store;

pub use aggregate::{Worker, WorkerPool};
pub use estimator::{CapacityEstimator, EstimateRequest};
pub use pool_config::{LaunchConfig, LifecyclePolicy, WorkerPoolConfig};
pub use provider_api::{
    IdentityProof, PoolDemand, ProviderError, RegistrationOutcome, WorkerProvider,
};
pub use provider_data::{worker_tags, AzureWorkerData, ProviderData, ResourceRecord, VmRecord};
pub use store::{WorkerMutator, WorkerPoolMutator, WorkerPoolStore, WorkerStore};
