// WorkerProvider - the capability port every provider backend implements.
//
// One flat trait instead of a provider class hierarchy: the scanning and
// provisioning loops drive it, and the worker-facing RPC surface calls
// `register_worker`. Azure is the only backend in this repository; the
// trait is the seam where others would plug in.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::shared_kernel::DomainError;
use crate::workers::aggregate::{Worker, WorkerPool};

/// Errors surfaced by provider operations.
#[derive(thiserror::Error, Debug)]
pub enum ProviderError {
    /// Uniform opaque answer for every registration failure. The
    /// distinguishing detail is logged, never returned to the caller.
    #[error("Signature validation error")]
    SignatureValidation,

    #[error("Cloud call failed: {message}")]
    Cloud { message: String },

    #[error(transparent)]
    Domain(#[from] DomainError),
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Capacity picture handed to `provision` for one pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolDemand {
    /// Capacity of workers that already exist (requested + running)
    pub existing_capacity: u32,

    /// Capacity asked for by the external demand source
    pub requested_capacity: u32,
}

/// Proof of identity presented by a booting worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityProof {
    /// base64(DER(PKCS#7 SignedData)) attested-data document
    pub document: String,
}

/// Successful registration answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationOutcome {
    /// When the credentials handed to the worker lapse
    pub expires: DateTime<Utc>,

    /// Opaque pool-supplied configuration for the worker
    pub worker_config: Value,
}

/// The provider capability surface.
///
/// `check_worker` must never let one worker's failure escape the call: the
/// scan loop relies on per-worker isolation.
#[async_trait]
pub trait WorkerProvider: Send + Sync {
    /// Identifier pools reference this provider by.
    fn provider_id(&self) -> &str;

    /// One-time startup work (CA material, credentials). Fatal on error.
    async fn setup(&self) -> ProviderResult<()>;

    /// Create enough worker records to cover `demand` for this pool.
    async fn provision(&self, pool: &WorkerPool, demand: &PoolDemand) -> ProviderResult<()>;

    /// Pool is going away. Workers terminate themselves and are reaped.
    async fn deprovision(&self, pool: &WorkerPool) -> ProviderResult<()>;

    /// Verify a worker's identity proof and bind the record to the live VM.
    async fn register_worker(
        &self,
        pool: &WorkerPool,
        worker: &Worker,
        proof: &IdentityProof,
    ) -> ProviderResult<RegistrationOutcome>;

    /// Reset per-pass scan accumulators.
    async fn scan_prepare(&self) -> ProviderResult<()>;

    /// Classify one worker and advance its pipeline by at most one step.
    async fn check_worker(&self, worker: &Worker) -> ProviderResult<()>;

    /// Report accumulated per-pool state gathered during the pass.
    async fn scan_cleanup(&self) -> ProviderResult<()>;

    /// Drive the removal pipeline for one worker.
    async fn remove_worker(&self, worker: &Worker, reason: &str) -> ProviderResult<()>;
}
