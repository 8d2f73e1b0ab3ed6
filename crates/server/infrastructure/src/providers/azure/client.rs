//! Azure Resource Manager REST client.
//!
//! The [`AzureApi`] trait is the seam the state machine is written against;
//! [`ArmClient`] is the production implementation over reqwest with AAD
//! client-credentials auth. Tests script a fake against the same trait.
//!
//! ARM addressing is uniform across the four resource kinds we manage, so
//! one generic get/put/delete per kind is enough. Long-running calls answer
//! with an `azure-asyncoperation` (or `location`) header whose URL is
//! stored verbatim on the worker record and polled later.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use cirrus_shared::config::AzureSettings;

use super::gateway::{BucketKind, CloudGateway};

const MANAGEMENT_BASE: &str = "https://management.azure.com";
const LOGIN_BASE: &str = "https://login.microsoftonline.com";

/// Refresh the AAD token this long before it actually expires.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(120);

/// Errors from the cloud gateway and client.
#[derive(thiserror::Error, Debug)]
pub enum CloudError {
    #[error("HTTP {status} from {context}: {message}")]
    Http {
        status: u16,
        context: String,
        message: String,
    },

    #[error("Transport failure: {message}")]
    Transport { message: String },

    #[error("Authentication failed: {message}")]
    Auth { message: String },

    #[error("Unexpected response from {context}: {message}")]
    Malformed { context: String, message: String },
}

impl CloudError {
    pub fn status(&self) -> Option<u16> {
        match self {
            CloudError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    pub(crate) fn transport(error: reqwest::Error) -> Self {
        CloudError::Transport {
            message: error.to_string(),
        }
    }
}

/// The four resource kinds a worker owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    PublicIp,
    Nic,
    Vm,
    Disk,
}

impl ResourceKind {
    /// ARM provider path segment.
    pub fn arm_segment(&self) -> &'static str {
        match self {
            ResourceKind::PublicIp => "Microsoft.Network/publicIPAddresses",
            ResourceKind::Nic => "Microsoft.Network/networkInterfaces",
            ResourceKind::Vm => "Microsoft.Compute/virtualMachines",
            ResourceKind::Disk => "Microsoft.Compute/disks",
        }
    }

    pub fn api_version(&self) -> &'static str {
        match self {
            ResourceKind::PublicIp | ResourceKind::Nic => "2023-09-01",
            ResourceKind::Vm | ResourceKind::Disk => "2024-03-01",
        }
    }

    pub fn display(&self) -> &'static str {
        match self {
            ResourceKind::PublicIp => "ip",
            ResourceKind::Nic => "nic",
            ResourceKind::Vm => "vm",
            ResourceKind::Disk => "disk",
        }
    }
}

/// One ARM resource body, kept as raw JSON with typed accessors.
#[derive(Debug, Clone)]
pub struct ArmResource {
    pub body: Value,
}

impl ArmResource {
    pub fn new(body: Value) -> Self {
        Self { body }
    }

    pub fn id(&self) -> Option<String> {
        self.body.get("id")?.as_str().map(str::to_string)
    }

    pub fn provisioning_state(&self) -> Option<&str> {
        self.body
            .get("properties")?
            .get("provisioningState")?
            .as_str()
    }

    /// Azure's immutable VM identity (VM bodies only).
    pub fn vm_id(&self) -> Option<String> {
        self.body
            .get("properties")?
            .get("vmId")?
            .as_str()
            .map(str::to_string)
    }

    /// `(name, managed disk id)` for the OS disk followed by each data
    /// disk, in cloud order (VM bodies only).
    pub fn disk_records(&self) -> Vec<(String, Option<String>)> {
        let mut records = Vec::new();
        let storage = match self.body.get("properties").and_then(|p| p.get("storageProfile")) {
            Some(storage) => storage,
            None => return records,
        };

        let extract = |disk: &Value| -> Option<(String, Option<String>)> {
            let name = disk.get("name")?.as_str()?.to_string();
            let id = disk
                .get("managedDisk")
                .and_then(|m| m.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string);
            Some((name, id))
        };

        if let Some(os_disk) = storage.get("osDisk").and_then(|d| extract(d)) {
            records.push(os_disk);
        }
        if let Some(data_disks) = storage.get("dataDisks").and_then(Value::as_array) {
            records.extend(data_disks.iter().filter_map(extract));
        }
        records
    }
}

/// Result of a `begin_create_or_update`.
#[derive(Debug, Clone)]
pub struct CreateStarted {
    /// Whatever body the PUT answered with; may already carry an id
    pub resource: ArmResource,

    /// Poll URL for the long-running operation, when one was returned
    pub operation_url: Option<String>,
}

/// The cloud surface the Azure state machine consumes.
#[async_trait]
pub trait AzureApi: Send + Sync {
    /// GET one resource by name. `None` means 404.
    async fn get_resource(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Option<ArmResource>, CloudError>;

    /// Start an idempotent create-or-update keyed on `name`.
    async fn begin_create_or_update(
        &self,
        kind: ResourceKind,
        name: &str,
        body: Value,
    ) -> Result<CreateStarted, CloudError>;

    /// Start a delete. Returns the operation URL if one was surfaced;
    /// deleting something already gone is not an error.
    async fn begin_delete(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Option<String>, CloudError>;

    /// GET the VM's instance view (power states). `None` means 404.
    async fn instance_view(&self, vm_name: &str) -> Result<Option<Value>, CloudError>;

    /// GET an async-operation URL verbatim. `None` means 404.
    async fn get_operation(&self, operation_url: &str) -> Result<Option<Value>, CloudError>;
}

struct CachedToken {
    access_token: String,
    refresh_after: Instant,
}

/// Production [`AzureApi`] over the ARM REST surface.
pub struct ArmClient {
    http: reqwest::Client,
    settings: AzureSettings,
    gateway: Arc<CloudGateway>,
    token: Mutex<Option<CachedToken>>,
}

impl ArmClient {
    pub fn new(settings: AzureSettings, gateway: Arc<CloudGateway>) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
            gateway,
            token: Mutex::new(None),
        }
    }

    fn resource_url(&self, kind: ResourceKind, name: &str) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/{}/{}?api-version={}",
            MANAGEMENT_BASE,
            self.settings.subscription_id,
            self.settings.resource_group_name,
            kind.arm_segment(),
            name,
            kind.api_version(),
        )
    }

    /// Fetch or reuse the AAD access token.
    async fn access_token(&self) -> Result<String, CloudError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_after {
                return Ok(token.access_token.clone());
            }
        }

        let url = format!("{}/{}/oauth2/token", LOGIN_BASE, self.settings.domain);
        let response = self
            .http
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.settings.client_id.as_str()),
                ("client_secret", self.settings.secret.as_str()),
                ("resource", MANAGEMENT_BASE),
            ])
            .send()
            .await
            .map_err(CloudError::transport)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(CloudError::Auth {
                message: format!("token endpoint answered {}: {}", status, truncate(&message)),
            });
        }

        let body: Value = response.json().await.map_err(CloudError::transport)?;
        let access_token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| CloudError::Auth {
                message: "token response missing access_token".to_string(),
            })?
            .to_string();

        // expires_in arrives as a string of seconds
        let expires_in = body
            .get("expires_in")
            .and_then(|v| {
                v.as_u64()
                    .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
            })
            .unwrap_or(3600);
        let lifetime = Duration::from_secs(expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);

        *cached = Some(CachedToken {
            access_token: access_token.clone(),
            refresh_after: Instant::now() + lifetime,
        });
        Ok(access_token)
    }

    /// One authenticated request; rebuilt from scratch per retry.
    async fn request(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<&Value>,
        context: &str,
    ) -> Result<reqwest::Response, CloudError> {
        let token = self.access_token().await?;
        let mut request = self.http.request(method, url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(CloudError::transport)?;

        let status = response.status();
        if status.is_success() || status.as_u16() == 404 {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(CloudError::Http {
            status: status.as_u16(),
            context: context.to_string(),
            message: truncate(&message),
        })
    }
}

fn truncate(message: &str) -> String {
    const LIMIT: usize = 512;
    if message.len() <= LIMIT {
        return message.to_string();
    }
    let mut end = LIMIT;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &message[..end])
}

fn operation_url_from(response: &reqwest::Response) -> Option<String> {
    for header in ["azure-asyncoperation", "location"] {
        if let Some(value) = response.headers().get(header) {
            if let Ok(value) = value.to_str() {
                return Some(value.to_string());
            }
        }
    }
    None
}

async fn json_or_null(response: reqwest::Response) -> Result<Value, CloudError> {
    let bytes = response.bytes().await.map_err(CloudError::transport)?;
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&bytes).map_err(|e| CloudError::Malformed {
        context: "response body".to_string(),
        message: e.to_string(),
    })
}

#[async_trait]
impl AzureApi for ArmClient {
    async fn get_resource(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Option<ArmResource>, CloudError> {
        let url = self.resource_url(kind, name);
        let context = format!("get {} {}", kind.display(), name);
        self.gateway
            .enqueue(BucketKind::Get, &context, || async {
                let response = self
                    .request(reqwest::Method::GET, &url, None, &context)
                    .await?;
                if response.status().as_u16() == 404 {
                    return Ok(None);
                }
                Ok(Some(ArmResource::new(json_or_null(response).await?)))
            })
            .await
    }

    async fn begin_create_or_update(
        &self,
        kind: ResourceKind,
        name: &str,
        body: Value,
    ) -> Result<CreateStarted, CloudError> {
        let url = self.resource_url(kind, name);
        let context = format!("create {} {}", kind.display(), name);
        self.gateway
            .enqueue(BucketKind::Query, &context, || {
                let body = body.clone();
                let url = url.clone();
                let context = context.clone();
                async move {
                    let response = self
                        .request(reqwest::Method::PUT, &url, Some(&body), &context)
                        .await?;
                    if response.status().as_u16() == 404 {
                        return Err(CloudError::Http {
                            status: 404,
                            context,
                            message: "create target scope not found".to_string(),
                        });
                    }
                    let operation_url = operation_url_from(&response);
                    let resource = ArmResource::new(json_or_null(response).await?);
                    Ok(CreateStarted {
                        resource,
                        operation_url,
                    })
                }
            })
            .await
    }

    async fn begin_delete(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Option<String>, CloudError> {
        let url = self.resource_url(kind, name);
        let context = format!("delete {} {}", kind.display(), name);
        self.gateway
            .enqueue(BucketKind::Query, &context, || async {
                let response = self
                    .request(reqwest::Method::DELETE, &url, None, &context)
                    .await?;
                if response.status().as_u16() == 404 {
                    return Ok(None);
                }
                Ok(operation_url_from(&response))
            })
            .await
    }

    async fn instance_view(&self, vm_name: &str) -> Result<Option<Value>, CloudError> {
        let url = format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/{}/{}/instanceView?api-version={}",
            MANAGEMENT_BASE,
            self.settings.subscription_id,
            self.settings.resource_group_name,
            ResourceKind::Vm.arm_segment(),
            vm_name,
            ResourceKind::Vm.api_version(),
        );
        let context = format!("instanceView {}", vm_name);
        self.gateway
            .enqueue(BucketKind::Get, &context, || async {
                let response = self
                    .request(reqwest::Method::GET, &url, None, &context)
                    .await?;
                if response.status().as_u16() == 404 {
                    return Ok(None);
                }
                Ok(Some(json_or_null(response).await?))
            })
            .await
    }

    async fn get_operation(&self, operation_url: &str) -> Result<Option<Value>, CloudError> {
        let context = "poll operation";
        self.gateway
            .enqueue(BucketKind::OpRead, context, || async {
                let response = self
                    .request(reqwest::Method::GET, operation_url, None, context)
                    .await?;
                if response.status().as_u16() == 404 {
                    return Ok(None);
                }
                Ok(Some(json_or_null(response).await?))
            })
            .await
    }
}
