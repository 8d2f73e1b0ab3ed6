// Worker domain - entities for provisioned cloud workers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::shared_kernel::{
    validate_worker_id, DomainError, Result, WorkerKey, WorkerPoolId, WorkerState, NULL_PROVIDER,
};
use crate::workers::pool_config::WorkerPoolConfig;
use crate::workers::provider_data::ProviderData;

/// One provisioned worker: the persistent record tracking a VM and its
/// supporting resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    pub worker_pool_id: WorkerPoolId,

    /// Provider that created this worker and owns its lifecycle
    pub provider_id: String,

    /// Cloud location the worker lives in
    pub worker_group: String,

    /// Doubles as the VM resource name; stable for the life of the record
    pub worker_id: String,

    pub state: WorkerState,

    /// How much pool capacity this worker accounts for
    pub capacity: u32,

    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub last_checked: DateTime<Utc>,

    /// When the row itself may be reaped
    pub expires: DateTime<Utc>,

    pub provider_data: ProviderData,
}

impl Worker {
    /// Create a worker record in `Requested` state. The worker id must be a
    /// valid cloud resource name.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_pool_id: WorkerPoolId,
        provider_id: impl Into<String>,
        worker_group: impl Into<String>,
        worker_id: impl Into<String>,
        capacity: u32,
        expires: DateTime<Utc>,
        provider_data: ProviderData,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let worker_id = worker_id.into();
        validate_worker_id(&worker_id)?;

        Ok(Self {
            worker_pool_id,
            provider_id: provider_id.into(),
            worker_group: worker_group.into(),
            worker_id,
            state: WorkerState::Requested,
            capacity,
            created: now,
            last_modified: now,
            last_checked: now,
            expires,
            provider_data,
        })
    }

    pub fn key(&self) -> WorkerKey {
        WorkerKey::new(
            self.worker_pool_id.clone(),
            self.worker_group.clone(),
            self.worker_id.clone(),
        )
    }

    /// Transition to `new_state`, refusing anything the state machine does
    /// not allow. Updates `last_modified`.
    pub fn set_state(&mut self, new_state: WorkerState, now: DateTime<Utc>) -> Result<()> {
        if !self.state.can_transition_to(&new_state) {
            return Err(DomainError::InvalidStateTransition {
                key: self.key(),
                from_state: self.state,
                to_state: new_state,
            });
        }
        self.state = new_state;
        self.last_modified = now;
        Ok(())
    }

    /// Push `expires` out to `until` if it is currently earlier.
    pub fn extend_expiry(&mut self, until: DateTime<Utc>) -> bool {
        if self.expires < until {
            self.expires = until;
            true
        } else {
            false
        }
    }

    pub fn azure_data(&self) -> Option<&crate::workers::provider_data::AzureWorkerData> {
        self.provider_data.as_azure()
    }
}

/// A named set of workers sharing a config and a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPool {
    pub worker_pool_id: WorkerPoolId,

    /// Active provider, or [`NULL_PROVIDER`] when scheduled for deletion
    pub provider_id: String,

    /// Providers this pool used before, most recent first
    #[serde(default)]
    pub previous_provider_ids: Vec<String>,

    /// Contact for notifications about this pool
    pub owner: String,

    pub config: WorkerPoolConfig,

    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl WorkerPool {
    pub fn new(
        worker_pool_id: WorkerPoolId,
        provider_id: impl Into<String>,
        owner: impl Into<String>,
        config: WorkerPoolConfig,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            worker_pool_id,
            provider_id: provider_id.into(),
            previous_provider_ids: Vec::new(),
            owner: owner.into(),
            config,
            created: now,
            last_modified: now,
        }
    }

    /// True once the pool has been scheduled for deletion.
    pub fn is_scheduled_for_deletion(&self) -> bool {
        self.provider_id == NULL_PROVIDER
    }

    /// Hand the pool to a different provider, remembering the old one at
    /// the head of `previous_provider_ids`.
    pub fn switch_provider(&mut self, new_provider_id: impl Into<String>, now: DateTime<Utc>) {
        let old = std::mem::replace(&mut self.provider_id, new_provider_id.into());
        self.previous_provider_ids.insert(0, old);
        self.last_modified = now;
    }

    /// Schedule the pool for deletion by switching to the null provider.
    pub fn schedule_for_deletion(&mut self, now: DateTime<Utc>) {
        self.switch_provider(NULL_PROVIDER, now);
    }
}
