//! Per-provider mutable state carried on each worker record.
//!
//! The cloud side is only ever addressed by resource *name*; names are
//! minted once at worker creation and never change. For each tracked
//! resource the `(name, id, operation)` triple encodes where the pipeline
//! stands:
//!
//! - `id` present: the resource exists and is fully created
//! - `operation` present, `id` absent: a create or delete is in flight
//! - both absent: not started, or already verified deleted

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::shared_kernel::WorkerPoolId;

/// Tag keys the control plane owns. User-supplied values for these keys are
/// always overwritten.
pub const RESERVED_TAG_KEYS: [&str; 7] = [
    "created-by",
    "managed-by",
    "provider-id",
    "worker-group",
    "worker-pool-id",
    "root-url",
    "owner",
];

/// Provider-specific worker state, tagged by provider kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "kebab-case")]
pub enum ProviderData {
    Azure(AzureWorkerData),
}

impl ProviderData {
    pub fn as_azure(&self) -> Option<&AzureWorkerData> {
        match self {
            ProviderData::Azure(data) => Some(data),
        }
    }

    pub fn as_azure_mut(&mut self) -> Option<&mut AzureWorkerData> {
        match self {
            ProviderData::Azure(data) => Some(data),
        }
    }
}

/// Tracking triple for one cloud resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRecord {
    /// Idempotency key for every cloud call about this resource
    pub name: String,

    /// Cloud-assigned id, set once creation is confirmed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Async-operation URL of an in-flight create or delete
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

impl ResourceRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
            operation: None,
        }
    }

    /// True once the resource is confirmed created.
    pub fn is_provisioned(&self) -> bool {
        self.id.is_some()
    }

    /// Forget both id and operation, e.g. once deletion is verified.
    pub fn clear(&mut self) {
        self.id = None;
        self.operation = None;
    }
}

/// The VM resource plus the identity fields registration binds to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmRecord {
    #[serde(flatten)]
    pub resource: ResourceRecord,

    /// Hostname inside the VM, distinct from the resource name
    pub computer_name: String,

    /// Create-call skeleton captured at worker creation
    pub config: Value,

    /// Azure's immutable VM identity, learned at creation or first lookup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_id: Option<String>,
}

/// Azure-specific worker state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureWorkerData {
    pub location: String,
    pub resource_group_name: String,
    pub subnet_id: String,

    /// Final tag set stamped on every created resource
    #[serde(default)]
    pub tags: HashMap<String, String>,

    pub vm: VmRecord,
    pub ip: ResourceRecord,
    pub nic: ResourceRecord,

    /// Disks discovered from the VM after creation, in cloud order
    #[serde(default)]
    pub disks: Vec<ResourceRecord>,

    /// Pre-multidisk records carried a single disk; migrated on first scan
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<ResourceRecord>,

    /// Epoch milliseconds after which the worker is torn down
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminate_after: Option<i64>,

    /// Milliseconds a registration remains valid before re-registration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reregistration_timeout: Option<i64>,

    /// Opaque configuration returned to the worker at registration
    #[serde(default)]
    pub worker_config: Value,
}

impl AzureWorkerData {
    /// Move a legacy singular `disk` into `disks`. Returns true if the
    /// record changed.
    pub fn migrate_legacy_disk(&mut self) -> bool {
        match self.disk.take() {
            Some(disk) if self.disks.is_empty() => {
                self.disks.push(disk);
                true
            }
            Some(_) => {
                // disks already populated; the singular field is stale
                true
            }
            None => false,
        }
    }
}

/// Compute the tag set for a worker's resources: user tags first, reserved
/// keys overwritten last.
pub fn worker_tags(
    user_tags: &HashMap<String, String>,
    provider_id: &str,
    root_url: &str,
    worker_pool_id: &WorkerPoolId,
    worker_group: &str,
    owner: &str,
) -> HashMap<String, String> {
    let mut tags = user_tags.clone();
    tags.insert("created-by".to_string(), format!("cirrus-wm-{}", provider_id));
    tags.insert("managed-by".to_string(), "cirrus".to_string());
    tags.insert("provider-id".to_string(), provider_id.to_string());
    tags.insert("worker-group".to_string(), worker_group.to_string());
    tags.insert(
        "worker-pool-id".to_string(),
        worker_pool_id.as_str().to_string(),
    );
    tags.insert("root-url".to_string(), root_url.to_string());
    tags.insert("owner".to_string(), owner.to_string());
    tags
}
