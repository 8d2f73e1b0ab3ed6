//! Structured-log implementation of the [`ErrorReporter`] port.
//!
//! Delivery to pool owners (email, tickets) belongs to the external
//! notification service; this sink keeps the stable log schema so operators
//! can alert on it.

use async_trait::async_trait;
use tracing::warn;

use cirrus_server_domain::reporting::{ErrorReporter, PoolError};
use cirrus_server_domain::shared_kernel::{Result, WorkerPoolId};

#[derive(Debug, Clone, Default)]
pub struct LogErrorReporter;

impl LogErrorReporter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ErrorReporter for LogErrorReporter {
    async fn report(&self, worker_pool_id: &WorkerPoolId, error: PoolError) -> Result<()> {
        warn!(
            worker_pool_id = %worker_pool_id,
            kind = error.kind.as_str(),
            title = %error.title,
            description = %error.description,
            extra = %error.extra,
            "worker pool error"
        );
        Ok(())
    }
}
