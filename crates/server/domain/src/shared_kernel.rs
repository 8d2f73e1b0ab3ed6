pub use cirrus_shared::WorkerState;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Provider id assigned to a pool that is scheduled for deletion.
pub const NULL_PROVIDER: &str = "null-provider";

/// Longest worker id the cloud side will accept as a VM name.
pub const MAX_WORKER_ID_LEN: usize = 38;

/// Domain errors
#[derive(thiserror::Error, Debug)]
pub enum DomainError {
    #[error("Worker not found: {key}")]
    WorkerNotFound { key: WorkerKey },

    #[error("Worker already exists: {key}")]
    WorkerAlreadyExists { key: WorkerKey },

    #[error("Worker pool not found: {worker_pool_id}")]
    WorkerPoolNotFound { worker_pool_id: WorkerPoolId },

    #[error("Worker pool already exists: {worker_pool_id}")]
    WorkerPoolAlreadyExists { worker_pool_id: WorkerPoolId },

    #[error("Invalid worker pool id {value}: expected \"provisioner/worker-type\"")]
    InvalidWorkerPoolId { value: String },

    #[error("Invalid worker id {value}: {reason}")]
    InvalidWorkerId { value: String, reason: String },

    #[error("Invalid worker state transition from {from_state} to {to_state} for {key}")]
    InvalidStateTransition {
        key: WorkerKey,
        from_state: WorkerState,
        to_state: WorkerState,
    },

    #[error("Worker pool {worker_pool_id} has no launch configurations")]
    NoLaunchConfigs { worker_pool_id: WorkerPoolId },

    #[error("Infrastructure error: {message}")]
    InfrastructureError { message: String },
}

impl From<serde_json::Error> for DomainError {
    fn from(error: serde_json::Error) -> Self {
        Self::InfrastructureError {
            message: format!("Serialization error: {}", error),
        }
    }
}

pub type Result<T> = std::result::Result<T, DomainError>;

/// Identifier of a worker pool, always of the form
/// `"provisioner-id/worker-type"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkerPoolId(String);

impl WorkerPoolId {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        let mut parts = value.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(provisioner), Some(worker_type), None)
                if !provisioner.is_empty() && !worker_type.is_empty() =>
            {
                Ok(Self(value))
            }
            _ => Err(DomainError::InvalidWorkerPoolId { value }),
        }
    }

    pub fn provisioner_id(&self) -> &str {
        self.0.split('/').next().unwrap_or_default()
    }

    pub fn worker_type(&self) -> &str {
        self.0.split('/').nth(1).unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for WorkerPoolId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<WorkerPoolId> for String {
    fn from(id: WorkerPoolId) -> Self {
        id.0
    }
}

impl fmt::Display for WorkerPoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Full identity of one worker: pool, group (cloud location), and id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerKey {
    pub worker_pool_id: WorkerPoolId,
    pub worker_group: String,
    pub worker_id: String,
}

impl WorkerKey {
    pub fn new(
        worker_pool_id: WorkerPoolId,
        worker_group: impl Into<String>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            worker_pool_id,
            worker_group: worker_group.into(),
            worker_id: worker_id.into(),
        }
    }
}

impl fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.worker_pool_id, self.worker_group, self.worker_id
        )
    }
}

/// Validate a worker id against the cloud naming rules: at most
/// [`MAX_WORKER_ID_LEN`] characters, lowercase, starting with a letter,
/// ending with a letter or digit, hyphens allowed in between.
pub fn validate_worker_id(value: &str) -> Result<()> {
    let invalid = |reason: &str| DomainError::InvalidWorkerId {
        value: value.to_string(),
        reason: reason.to_string(),
    };

    if value.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if value.len() > MAX_WORKER_ID_LEN {
        return Err(invalid("exceeds 38 characters"));
    }

    let bytes = value.as_bytes();
    if !bytes[0].is_ascii_lowercase() {
        return Err(invalid("must start with a lowercase letter"));
    }
    let last = bytes[bytes.len() - 1];
    if !(last.is_ascii_lowercase() || last.is_ascii_digit()) {
        return Err(invalid("must end with a letter or digit"));
    }
    if !bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
    {
        return Err(invalid(
            "must contain only lowercase letters, digits, and hyphens",
        ));
    }

    Ok(())
}
