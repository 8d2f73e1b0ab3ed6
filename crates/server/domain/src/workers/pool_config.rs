//! Persisted worker pool configuration.
//!
//! The pool config is owned by the external pool API; this crate only reads
//! it. Cloud-facing profile sections stay opaque JSON and are passed through
//! to the create call, with the reserved pieces (tags, disk names, identity
//! fields) overridden at provisioning time.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Configuration shared by every worker in a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPoolConfig {
    /// Capacity the pool never shrinks below
    pub min_capacity: u32,

    /// Capacity the pool never grows beyond
    pub max_capacity: u32,

    #[serde(default)]
    pub lifecycle: LifecyclePolicy,

    /// Alternative worker shapes; the provisioner samples uniformly
    pub launch_configs: Vec<LaunchConfig>,
}

/// Registration deadlines, in seconds.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecyclePolicy {
    /// How long a freshly created worker may stay unregistered before it is
    /// torn down. None means no deadline.
    #[serde(default)]
    pub registration_timeout: Option<i64>,

    /// How long a registered worker may run before it must re-register.
    /// None falls back to the provider default.
    #[serde(default)]
    pub reregistration_timeout: Option<i64>,
}

/// One alternative spec for creating a worker within a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchConfig {
    #[serde(default = "default_capacity_per_instance")]
    pub capacity_per_instance: u32,

    /// Azure location, doubles as the worker group
    pub location: String,

    /// Subnet the worker's NIC is attached to
    pub subnet_id: String,

    /// Passed through to the VM create call
    pub hardware_profile: Value,

    /// Passed through, minus any user-supplied disk names
    pub storage_profile: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_profile: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_profile: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing_profile: Option<Value>,

    /// User tags; reserved keys are overwritten at provisioning time
    #[serde(default)]
    pub tags: HashMap<String, String>,

    /// Opaque configuration handed to the worker at registration
    #[serde(default)]
    pub worker_config: Value,
}

fn default_capacity_per_instance() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_launch_config_from_pool_json() {
        let config: WorkerPoolConfig = serde_json::from_value(json!({
            "minCapacity": 1,
            "maxCapacity": 4,
            "lifecycle": { "registrationTimeout": 1800 },
            "launchConfigs": [{
                "location": "westus",
                "subnetId": "/subscriptions/s/virtualNetworks/v/subnets/sn",
                "hardwareProfile": { "vmSize": "Basic_A2" },
                "storageProfile": { "osDisk": { "createOption": "FromImage" } },
                "tags": { "team": "releng" }
            }]
        }))
        .unwrap();

        assert_eq!(config.min_capacity, 1);
        assert_eq!(config.lifecycle.registration_timeout, Some(1800));
        assert_eq!(config.lifecycle.reregistration_timeout, None);

        let lc = &config.launch_configs[0];
        assert_eq!(lc.capacity_per_instance, 1);
        assert_eq!(lc.location, "westus");
        assert_eq!(lc.tags["team"], "releng");
        assert!(lc.os_profile.is_none());
    }
}
