//! Configuration module for the cirrus control plane.
//!
//! Centralized configuration loading, validation, and immutable DTOs.
//!
//! # Architecture
//!
//! 1. **Single Source of Truth**: configuration is loaded once at startup
//! 2. **Fail Fast**: missing credentials or CA material abort startup
//! 3. **DTO Pattern**: configuration is immutable and passed via dependency injection
//! 4. **Env File Priority**: `.env` file > environment variables > error
//!
//! # Environment Variables
//!
//! ## Required
//!
//! - `CIRRUS_PROVIDER_ID`: identifier this provider registers workers under
//! - `CIRRUS_ROOT_URL`: public root URL handed to booting workers
//! - `CIRRUS_AZURE_CLIENT_ID` / `CIRRUS_AZURE_SECRET`: AAD app credentials
//! - `CIRRUS_AZURE_DOMAIN`: AAD tenant domain
//! - `CIRRUS_AZURE_SUBSCRIPTION_ID`: target subscription
//! - `CIRRUS_AZURE_RESOURCE_GROUP`: resource group workers are created in
//! - `CIRRUS_CA_DIR`: directory of pinned intermediate CA PEM files
//!
//! ## Optional
//!
//! - `CIRRUS_AZURE_STORAGE_ACCOUNT`: storage account for boot diagnostics
//! - `CIRRUS_BACKOFF_DELAY_MS`: base backoff for throttled cloud calls (default: 1000)
//! - `CIRRUS_PROVISION_INTERVAL_SECS` / `CIRRUS_SCAN_INTERVAL_SECS`: loop ticks
//! - `CIRRUS_MAX_CONCURRENCY`: per-loop worker fan-out bound (default: 16)
//! - `RUST_LOG`: log filter (default: "info")

pub mod dto;
pub mod error;
pub mod loader;
pub mod validator;

pub use dto::{ApiRateLimits, AzureSettings, RateLimitSettings, ServerSettings};
pub use error::{ConfigError, Result};
pub use loader::ConfigLoader;
pub use validator::validate_server_settings;
