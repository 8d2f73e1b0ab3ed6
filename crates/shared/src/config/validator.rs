//! Configuration validation
//!
//! Structural checks that run after loading, before anything else starts.
//! Filesystem checks (CA directory contents) happen where the material is
//! consumed, at provider setup.

use super::dto::ServerSettings;
use super::error::{ConfigError, Result};

/// Validate the loaded server settings.
pub fn validate_server_settings(settings: &ServerSettings) -> Result<()> {
    let azure = &settings.azure;

    for (name, value) in [
        ("CIRRUS_PROVIDER_ID", &azure.provider_id),
        ("CIRRUS_ROOT_URL", &azure.root_url),
        ("CIRRUS_AZURE_CLIENT_ID", &azure.client_id),
        ("CIRRUS_AZURE_SECRET", &azure.secret),
        ("CIRRUS_AZURE_DOMAIN", &azure.domain),
        ("CIRRUS_AZURE_SUBSCRIPTION_ID", &azure.subscription_id),
        ("CIRRUS_AZURE_RESOURCE_GROUP", &azure.resource_group_name),
    ] {
        if value.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "{} must not be empty",
                name
            )));
        }
    }

    if !azure.root_url.starts_with("http://") && !azure.root_url.starts_with("https://") {
        return Err(ConfigError::Validation(format!(
            "CIRRUS_ROOT_URL must be an http(s) URL, got {}",
            azure.root_url
        )));
    }

    if azure.root_url.ends_with('/') {
        return Err(ConfigError::Validation(
            "CIRRUS_ROOT_URL must not end with a trailing slash".to_string(),
        ));
    }

    if settings.max_concurrency == 0 {
        return Err(ConfigError::Validation(
            "CIRRUS_MAX_CONCURRENCY must be at least 1".to_string(),
        ));
    }

    Ok(())
}
