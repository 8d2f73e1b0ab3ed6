//! Configuration loader
//!
//! Loads configuration from an optional `.env` file and the process
//! environment, then validates it. All failures here are fatal.

use std::path::Path;

use super::dto::{ApiRateLimits, AzureSettings, RateLimitSettings, ServerSettings};
use super::error::{ConfigError, Result};
use super::validator::validate_server_settings;

/// Configuration loader
///
/// # Priority
///
/// Values from the `.env` file take precedence over the process environment,
/// which allows local development overrides without touching the system
/// environment.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// Optional path to .env file
    env_file_path: Option<std::path::PathBuf>,
}

impl ConfigLoader {
    /// Create a new ConfigLoader.
    ///
    /// # Example
    ///
    /// ```
    /// use cirrus_shared::config::ConfigLoader;
    ///
    /// // Without .env file
    /// let loader = ConfigLoader::new(None);
    ///
    /// // With .env file
    /// let loader = ConfigLoader::new(Some(".env".into()));
    /// ```
    pub fn new(env_file_path: Option<std::path::PathBuf>) -> Self {
        Self { env_file_path }
    }

    /// Load and validate the full server configuration.
    pub fn load_server_settings(&self) -> Result<ServerSettings> {
        if let Some(path) = &self.env_file_path {
            self.load_env_file(path)?;
        }

        let settings = ServerSettings::from_env()?;
        validate_server_settings(&settings)?;
        Ok(settings)
    }

    /// Load .env file, failing if it does not exist.
    fn load_env_file(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(ConfigError::EnvFileLoad {
                path: path.to_path_buf(),
                source: dotenv::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("File not found: {}", path.display()),
                )),
            });
        }

        dotenv::from_path(path).map_err(|e| ConfigError::EnvFileLoad {
            path: path.to_path_buf(),
            source: e,
        })?;

        Ok(())
    }
}

impl Default for ConfigLoader {
    /// Equivalent to `ConfigLoader::new(None)`
    fn default() -> Self {
        Self::new(None)
    }
}

impl ServerSettings {
    /// Build server settings from environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            azure: AzureSettings::from_env()?,
            provision_interval_secs: parse_optional_var("CIRRUS_PROVISION_INTERVAL_SECS", 60)?,
            scan_interval_secs: parse_optional_var("CIRRUS_SCAN_INTERVAL_SECS", 120)?,
            max_concurrency: parse_optional_var("CIRRUS_MAX_CONCURRENCY", 16)?,
        })
    }
}

impl AzureSettings {
    /// Build Azure provider settings from environment variables.
    ///
    /// # Required Variables
    ///
    /// - `CIRRUS_PROVIDER_ID`
    /// - `CIRRUS_ROOT_URL`
    /// - `CIRRUS_AZURE_CLIENT_ID` / `CIRRUS_AZURE_SECRET`
    /// - `CIRRUS_AZURE_DOMAIN`
    /// - `CIRRUS_AZURE_SUBSCRIPTION_ID`
    /// - `CIRRUS_AZURE_RESOURCE_GROUP`
    /// - `CIRRUS_CA_DIR`
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            provider_id: required_var("CIRRUS_PROVIDER_ID")?,
            root_url: required_var("CIRRUS_ROOT_URL")?,
            client_id: required_var("CIRRUS_AZURE_CLIENT_ID")?,
            secret: required_var("CIRRUS_AZURE_SECRET")?,
            domain: required_var("CIRRUS_AZURE_DOMAIN")?,
            subscription_id: required_var("CIRRUS_AZURE_SUBSCRIPTION_ID")?,
            resource_group_name: required_var("CIRRUS_AZURE_RESOURCE_GROUP")?,
            storage_account_name: std::env::var("CIRRUS_AZURE_STORAGE_ACCOUNT").ok(),
            ca_cert_dir: required_var("CIRRUS_CA_DIR")?.into(),
            api_rate_limits: ApiRateLimits {
                query: bucket_from_env("QUERY")?,
                get: bucket_from_env("GET")?,
                list: bucket_from_env("LIST")?,
                op_read: bucket_from_env("OP_READ")?,
            },
            backoff_delay_ms: parse_optional_var("CIRRUS_BACKOFF_DELAY_MS", 1_000)?,
        })
    }
}

/// Read one bucket's override, e.g. `CIRRUS_RATE_QUERY_CAPACITY`.
fn bucket_from_env(name: &str) -> Result<RateLimitSettings> {
    let defaults = RateLimitSettings::default();
    Ok(RateLimitSettings {
        interval_ms: parse_optional_var(
            &format!("CIRRUS_RATE_{}_INTERVAL_MS", name),
            defaults.interval_ms,
        )?,
        capacity: parse_optional_var(&format!("CIRRUS_RATE_{}_CAPACITY", name), defaults.capacity)?,
    })
}

fn required_var(var: &str) -> Result<String> {
    std::env::var(var).map_err(|_| ConfigError::MissingRequired {
        var: var.to_string(),
    })
}

/// Parse an optional environment variable with a default value.
fn parse_optional_var<T: std::str::FromStr>(var: &str, default: T) -> Result<T> {
    match std::env::var(var) {
        Ok(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
            var: var.to_string(),
            value,
        }),
        Err(_) => Ok(default),
    }
}
