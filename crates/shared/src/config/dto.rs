//! Configuration Data Transfer Objects (DTOs)
//!
//! Immutable configuration loaded once at startup and passed to services
//! via dependency injection.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for the cirrus server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Azure provider configuration
    pub azure: AzureSettings,

    /// Seconds between provisioning passes
    pub provision_interval_secs: u64,

    /// Seconds between scan passes
    pub scan_interval_secs: u64,

    /// Bound on concurrent per-worker tasks inside each loop
    pub max_concurrency: usize,
}

/// Credentials and tuning for the Azure provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzureSettings {
    /// Provider id this instance registers workers under
    pub provider_id: String,

    /// Public root URL handed to booting workers
    pub root_url: String,

    /// AAD application (client) id
    pub client_id: String,

    /// AAD application secret
    pub secret: String,

    /// AAD tenant domain, e.g. "example.onmicrosoft.com"
    pub domain: String,

    /// Azure subscription all resources live in
    pub subscription_id: String,

    /// Resource group workers are created in
    pub resource_group_name: String,

    /// Storage account used for boot diagnostics, if any
    pub storage_account_name: Option<String>,

    /// Directory containing the pinned Microsoft intermediate CA PEM files
    pub ca_cert_dir: PathBuf,

    /// Per-bucket rate limits for outgoing ARM calls
    #[serde(default)]
    pub api_rate_limits: ApiRateLimits,

    /// Base delay for the cloud-call backoff classifier, in milliseconds
    #[serde(default = "default_backoff_delay_ms")]
    pub backoff_delay_ms: u64,
}

fn default_backoff_delay_ms() -> u64 {
    1_000
}

/// One token bucket's parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Refill interval in milliseconds
    pub interval_ms: u64,

    /// Tokens granted per interval
    pub capacity: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            interval_ms: 100_000,
            capacity: 2_000,
        }
    }
}

/// Rate limits for the four named cloud-call buckets.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ApiRateLimits {
    #[serde(default)]
    pub query: RateLimitSettings,

    #[serde(default)]
    pub get: RateLimitSettings,

    #[serde(default)]
    pub list: RateLimitSettings,

    #[serde(default)]
    pub op_read: RateLimitSettings,
}
