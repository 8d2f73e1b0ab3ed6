// Pool-scoped error notification port.
//
// Providers surface operational failures (creation, deletion, operation,
// registration) against the owning pool through this hook. Delivery is an
// external concern; the port must not fail the caller's pipeline.

use async_trait::async_trait;
use serde_json::Value;

use crate::shared_kernel::{Result, WorkerPoolId};

/// Taxonomy of reportable pool errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// Failed resource creation or unknown power/provisioning state
    CreationError,
    /// Failure while tearing a worker down; retried next pass
    DeletionError,
    /// An async cloud operation reported an error body
    OperationError,
    /// Identity proof rejected (detail stays server-side)
    RegistrationError,
}

impl PoolErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolErrorKind::CreationError => "creation-error",
            PoolErrorKind::DeletionError => "deletion-error",
            PoolErrorKind::OperationError => "operation-error",
            PoolErrorKind::RegistrationError => "registration-error",
        }
    }
}

/// One reportable error, with free-form context for the pool owner.
#[derive(Debug, Clone)]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub title: String,
    pub description: String,
    pub extra: Value,
}

impl PoolError {
    pub fn new(
        kind: PoolErrorKind,
        title: impl Into<String>,
        description: impl Into<String>,
        extra: Value,
    ) -> Self {
        Self {
            kind,
            title: title.into(),
            description: description.into(),
            extra,
        }
    }
}

#[async_trait]
pub trait ErrorReporter: Send + Sync {
    async fn report(&self, worker_pool_id: &WorkerPoolId, error: PoolError) -> Result<()>;
}
