//! The Azure provider state machine.
//!
//! Implements the `WorkerProvider` port: capacity-driven creation of worker
//! records, the per-worker provisioning pipeline (ip → nic → vm → disks),
//! health classification on every scan pass, identity-proof registration,
//! and reverse-order teardown. All cloud effects go through the step
//! engine; all record changes go through the worker store so progress
//! survives process restarts.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{Duration, Utc};
use dashmap::DashMap;
use rand::seq::SliceRandom;
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use async_trait::async_trait;

use cirrus_server_domain::reporting::{ErrorReporter, PoolError, PoolErrorKind};
use cirrus_server_domain::shared_kernel::{DomainError, WorkerPoolId, WorkerState};
use cirrus_server_domain::workers::provider_api::{
    IdentityProof, PoolDemand, ProviderError, ProviderResult, RegistrationOutcome, WorkerProvider,
};
use cirrus_server_domain::workers::provider_data::{
    worker_tags, AzureWorkerData, ProviderData, ResourceRecord, VmRecord,
};
use cirrus_server_domain::workers::store::{WorkerPoolStore, WorkerStore};
use cirrus_server_domain::workers::{
    CapacityEstimator, EstimateRequest, LaunchConfig, Worker, WorkerPool,
};
use cirrus_shared::config::AzureSettings;

use super::attestation::AttestationVerifier;
use super::client::{AzureApi, CloudError, ResourceKind};
use super::names::{generate_admin_password, mint_worker_names, nicer_id};
use super::steps::{
    is_fail_provisioning_state, provision_resource, remove_resource, ProvisionOutcome,
};

/// Registration lifetime when the pool does not set one.
const DEFAULT_REGISTRATION_LIFETIME_HOURS: i64 = 96;

/// Healthy workers whose row expires within this window get extended.
const EXPIRY_EXTENSION_THRESHOLD_DAYS: i64 = 1;

/// How far a healthy worker's row expiry is pushed out.
const EXPIRY_EXTENSION_DAYS: i64 = 7;

/// Row lifetime stamped on freshly minted workers.
const NEW_WORKER_LIFETIME_DAYS: i64 = 7;

const HEALTHY_PROVISIONING_STATES: [&str; 3] = ["Succeeded", "Creating", "Updating"];

const HEALTHY_POWER_STATES: [&str; 2] = ["PowerState/running", "PowerState/starting"];

const FAIL_POWER_STATES: [&str; 4] = [
    "PowerState/stopping",
    "PowerState/stopped",
    "PowerState/deallocating",
    "PowerState/deallocated",
];

/// Where one provisioning-pipeline invocation ended up.
enum PipelineStatus {
    /// Some resource is still materialising; try again next pass
    InFlight,
    /// ip, nic, and vm all have ids
    Complete,
    /// A resource failed or vanished; tear the worker down
    Abandon {
        reason: String,
        operation_error: Option<String>,
    },
}

pub struct AzureProvider {
    provider_id: String,
    root_url: String,
    resource_group_name: String,
    ca_cert_dir: PathBuf,
    api: Arc<dyn AzureApi>,
    workers: Arc<dyn WorkerStore>,
    pools: Arc<dyn WorkerPoolStore>,
    reporter: Arc<dyn ErrorReporter>,
    estimator: Arc<dyn CapacityEstimator>,
    verifier: OnceCell<AttestationVerifier>,

    /// Capacity seen per pool during the current scan pass
    seen: DashMap<WorkerPoolId, u64>,

    /// Errors accumulated per pool during the current scan pass
    errors: DashMap<WorkerPoolId, Vec<PoolError>>,
}

/// Builder for [`AzureProvider`].
#[derive(Default)]
pub struct AzureProviderBuilder {
    settings: Option<AzureSettings>,
    api: Option<Arc<dyn AzureApi>>,
    workers: Option<Arc<dyn WorkerStore>>,
    pools: Option<Arc<dyn WorkerPoolStore>>,
    reporter: Option<Arc<dyn ErrorReporter>>,
    estimator: Option<Arc<dyn CapacityEstimator>>,
    verifier: Option<AttestationVerifier>,
}

impl AzureProviderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(mut self, settings: AzureSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn with_api(mut self, api: Arc<dyn AzureApi>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn with_worker_store(mut self, workers: Arc<dyn WorkerStore>) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn with_pool_store(mut self, pools: Arc<dyn WorkerPoolStore>) -> Self {
        self.pools = Some(pools);
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn CapacityEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    /// Inject a pre-built verifier instead of loading the CA directory at
    /// setup. Used by tests with a throwaway CA.
    pub fn with_verifier(mut self, verifier: AttestationVerifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn build(self) -> Result<AzureProvider, DomainError> {
        let missing = |what: &str| DomainError::InfrastructureError {
            message: format!("AzureProviderBuilder: {} not configured", what),
        };

        let settings = self.settings.ok_or_else(|| missing("settings"))?;
        let verifier_cell = OnceCell::new();
        if let Some(verifier) = self.verifier {
            let _ = verifier_cell.set(verifier);
        }

        Ok(AzureProvider {
            provider_id: settings.provider_id.clone(),
            root_url: settings.root_url.clone(),
            resource_group_name: settings.resource_group_name.clone(),
            ca_cert_dir: settings.ca_cert_dir.clone(),
            api: self.api.ok_or_else(|| missing("api"))?,
            workers: self.workers.ok_or_else(|| missing("worker store"))?,
            pools: self.pools.ok_or_else(|| missing("pool store"))?,
            reporter: self.reporter.ok_or_else(|| missing("reporter"))?,
            estimator: self.estimator.ok_or_else(|| missing("estimator"))?,
            verifier: verifier_cell,
            seen: DashMap::new(),
            errors: DashMap::new(),
        })
    }
}

fn cloud_error(error: CloudError) -> ProviderError {
    ProviderError::Cloud {
        message: error.to_string(),
    }
}

fn azure_data_mut(worker: &mut Worker) -> Result<&mut AzureWorkerData, ProviderError> {
    let key = worker.key();
    worker.provider_data.as_azure_mut().ok_or_else(|| {
        ProviderError::Domain(DomainError::InfrastructureError {
            message: format!("worker {} does not carry azure provider data", key),
        })
    })
}

fn azure_data(worker: &Worker) -> Result<&AzureWorkerData, ProviderError> {
    worker.provider_data.as_azure().ok_or_else(|| {
        ProviderError::Domain(DomainError::InfrastructureError {
            message: format!("worker {} does not carry azure provider data", worker.key()),
        })
    })
}

/// Drop user-supplied disk names; the cloud-generated names are
/// authoritative and get read back after VM creation.
fn strip_disk_names(mut storage_profile: Value) -> Value {
    if let Some(os_disk) = storage_profile
        .get_mut("osDisk")
        .and_then(Value::as_object_mut)
    {
        os_disk.remove("name");
    }
    if let Some(data_disks) = storage_profile
        .get_mut("dataDisks")
        .and_then(Value::as_array_mut)
    {
        for disk in data_disks {
            if let Some(disk) = disk.as_object_mut() {
                disk.remove("name");
            }
        }
    }
    storage_profile
}

/// Pull the `PowerState/...` codes out of an instance view body.
fn power_states(instance_view: &Value) -> Vec<String> {
    instance_view
        .get("statuses")
        .and_then(Value::as_array)
        .map(|statuses| {
            statuses
                .iter()
                .filter_map(|status| status.get("code").and_then(Value::as_str))
                .filter(|code| code.starts_with("PowerState/"))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

impl AzureProvider {
    pub fn builder() -> AzureProviderBuilder {
        AzureProviderBuilder::new()
    }

    fn record_pool_error(&self, worker_pool_id: &WorkerPoolId, error: PoolError) {
        self.errors
            .entry(worker_pool_id.clone())
            .or_default()
            .push(error);
    }

    /// Mint names, capture the launch config, and persist one empty worker
    /// row in `requested` state. The pipelines pick it up from there.
    async fn create_worker(&self, pool: &WorkerPool, launch: &LaunchConfig) -> ProviderResult<()> {
        let now = Utc::now();
        let names = mint_worker_names();

        let mut vm_config = json!({
            "hardwareProfile": launch.hardware_profile.clone(),
            "storageProfile": strip_disk_names(launch.storage_profile.clone()),
        });
        if let Some(os_profile) = &launch.os_profile {
            vm_config["osProfile"] = os_profile.clone();
        }
        if let Some(network_profile) = &launch.network_profile {
            vm_config["networkProfile"] = network_profile.clone();
        }
        if let Some(billing_profile) = &launch.billing_profile {
            vm_config["billingProfile"] = billing_profile.clone();
        }

        let tags = worker_tags(
            &launch.tags,
            &self.provider_id,
            &self.root_url,
            &pool.worker_pool_id,
            &launch.location,
            &pool.owner,
        );

        let lifecycle = &pool.config.lifecycle;
        let terminate_after = lifecycle
            .registration_timeout
            .map(|secs| now.timestamp_millis() + secs * 1_000);
        let reregistration_timeout = lifecycle.reregistration_timeout.map(|secs| secs * 1_000);

        let data = AzureWorkerData {
            location: launch.location.clone(),
            resource_group_name: self.resource_group_name.clone(),
            subnet_id: launch.subnet_id.clone(),
            tags,
            vm: VmRecord {
                resource: ResourceRecord::new(&names.vm_name),
                computer_name: names.computer_name.clone(),
                config: vm_config,
                vm_id: None,
            },
            ip: ResourceRecord::new(&names.ip_name),
            nic: ResourceRecord::new(&names.nic_name),
            disks: Vec::new(),
            disk: None,
            terminate_after,
            reregistration_timeout,
            worker_config: launch.worker_config.clone(),
        };

        let worker = Worker::new(
            pool.worker_pool_id.clone(),
            &self.provider_id,
            &launch.location,
            &names.vm_name,
            launch.capacity_per_instance,
            now + Duration::days(NEW_WORKER_LIFETIME_DAYS),
            ProviderData::Azure(data),
            now,
        )?;

        let worker = self.workers.create(worker).await?;
        info!(
            event = "worker-requested",
            worker_pool_id = %worker.worker_pool_id,
            worker_group = %worker.worker_group,
            worker_id = %worker.worker_id,
            capacity = worker.capacity,
            "worker requested"
        );
        Ok(())
    }

    /// Write a snapshot's progress back through the store. State changes
    /// go through the state machine, so a stale snapshot can never drag a
    /// row backwards; identity learned elsewhere is preserved.
    async fn persist(&self, snapshot: &Worker) -> Result<Worker, DomainError> {
        let key = snapshot.key();
        let mut data = snapshot.provider_data.clone();
        let state = snapshot.state;
        let last_checked = snapshot.last_checked;
        let expires = snapshot.expires;
        let now = Utc::now();

        self.workers
            .update(
                &key,
                Box::new(move |row| {
                    if let (Some(existing), Some(fresh)) =
                        (row.provider_data.as_azure(), data.as_azure_mut())
                    {
                        if fresh.vm.vm_id.is_none() {
                            fresh.vm.vm_id = existing.vm.vm_id.clone();
                        }
                    }
                    row.provider_data = data;
                    row.last_checked = last_checked;
                    if row.expires < expires {
                        row.expires = expires;
                    }
                    if row.state != state {
                        let _ = row.set_state(state, now);
                    }
                }),
            )
            .await
    }

    /// Advance the ip → nic → vm pipeline. Stops at the first resource
    /// that is still materialising.
    async fn advance_provisioning(&self, worker: &mut Worker) -> ProviderResult<PipelineStatus> {
        let worker_pool_id = worker.worker_pool_id.clone();
        let worker_group = worker.worker_group.clone();
        let provider_id = self.provider_id.clone();
        let root_url = self.root_url.clone();

        // Step 1: public IP
        {
            let azure = azure_data_mut(worker)?;
            if azure.ip.id.is_none() {
                let location = azure.location.clone();
                let tags = azure.tags.clone();
                let outcome = provision_resource(
                    self.api.as_ref(),
                    ResourceKind::PublicIp,
                    &mut azure.ip,
                    move || {
                        json!({
                            "location": location,
                            "tags": tags,
                            "properties": { "publicIPAllocationMethod": "Dynamic" }
                        })
                    },
                )
                .await
                .map_err(cloud_error)?;

                match outcome {
                    ProvisionOutcome::Ready | ProvisionOutcome::Created(_) => {}
                    ProvisionOutcome::Pending => return Ok(PipelineStatus::InFlight),
                    ProvisionOutcome::Abandon {
                        reason,
                        operation_error,
                    } => {
                        return Ok(PipelineStatus::Abandon {
                            reason,
                            operation_error,
                        })
                    }
                }
            }
        }

        // Step 2: NIC, bound to the IP
        {
            let azure = azure_data_mut(worker)?;
            if azure.nic.id.is_none() {
                let config = json!({
                    "location": azure.location.clone(),
                    "tags": azure.tags.clone(),
                    "properties": {
                        "ipConfigurations": [{
                            "name": azure.nic.name.clone(),
                            "properties": {
                                "privateIPAllocationMethod": "Dynamic",
                                "subnet": { "id": azure.subnet_id.clone() },
                                "publicIPAddress": { "id": azure.ip.id.clone() }
                            }
                        }]
                    }
                });
                let outcome = provision_resource(
                    self.api.as_ref(),
                    ResourceKind::Nic,
                    &mut azure.nic,
                    move || config,
                )
                .await
                .map_err(cloud_error)?;

                match outcome {
                    ProvisionOutcome::Created(_) | ProvisionOutcome::Ready => {
                        // wire the nic into the VM create config
                        let nic_id = azure.nic.id.clone();
                        azure.vm.config["networkProfile"] = json!({
                            "networkInterfaces": [{ "id": nic_id }]
                        });
                    }
                    ProvisionOutcome::Pending => return Ok(PipelineStatus::InFlight),
                    ProvisionOutcome::Abandon {
                        reason,
                        operation_error,
                    } => {
                        return Ok(PipelineStatus::Abandon {
                            reason,
                            operation_error,
                        })
                    }
                }
            }
        }

        // Step 3: the VM itself
        {
            let azure = azure_data_mut(worker)?;
            if azure.vm.resource.id.is_none() {
                let custom_data = json!({
                    "workerPoolId": worker_pool_id,
                    "providerId": provider_id,
                    "workerGroup": worker_group,
                    "rootUrl": root_url,
                    "workerConfig": azure.worker_config.clone(),
                });

                let mut properties = azure.vm.config.clone();
                if !properties
                    .get("osProfile")
                    .map(Value::is_object)
                    .unwrap_or(false)
                {
                    properties["osProfile"] = json!({});
                }
                let os_profile = &mut properties["osProfile"];
                os_profile["computerName"] = json!(azure.vm.computer_name.clone());
                // throwaway credentials; generated per attempt, never stored
                os_profile["adminUsername"] = json!(format!("u{}", &nicer_id()[..11]));
                os_profile["adminPassword"] = json!(generate_admin_password());
                os_profile["customData"] = json!(BASE64.encode(custom_data.to_string()));

                let body = json!({
                    "location": azure.location.clone(),
                    "tags": azure.tags.clone(),
                    "properties": properties,
                });

                let outcome = provision_resource(
                    self.api.as_ref(),
                    ResourceKind::Vm,
                    &mut azure.vm.resource,
                    move || body,
                )
                .await
                .map_err(cloud_error)?;

                match outcome {
                    ProvisionOutcome::Created(resource) => {
                        azure.vm.vm_id = resource.vm_id();
                        // cloud-assigned disk names are authoritative
                        azure.disks = resource
                            .disk_records()
                            .into_iter()
                            .map(|(name, id)| ResourceRecord {
                                name,
                                id,
                                operation: None,
                            })
                            .collect();
                    }
                    ProvisionOutcome::Ready => {}
                    ProvisionOutcome::Pending => return Ok(PipelineStatus::InFlight),
                    ProvisionOutcome::Abandon {
                        reason,
                        operation_error,
                    } => {
                        return Ok(PipelineStatus::Abandon {
                            reason,
                            operation_error,
                        })
                    }
                }
            }
        }

        Ok(PipelineStatus::Complete)
    }

    /// Handle a provisioning-pipeline verdict for one requested worker.
    async fn drive_provisioning(&self, worker: &mut Worker) -> ProviderResult<()> {
        match self.advance_provisioning(worker).await {
            Ok(PipelineStatus::Complete) | Ok(PipelineStatus::InFlight) => {
                self.persist(worker).await?;
                Ok(())
            }
            Ok(PipelineStatus::Abandon {
                reason,
                operation_error,
            }) => {
                if let Some(message) = operation_error {
                    self.record_pool_error(
                        &worker.worker_pool_id,
                        PoolError::new(
                            PoolErrorKind::OperationError,
                            "Cloud operation failed",
                            message,
                            json!({ "workerId": worker.worker_id }),
                        ),
                    );
                }
                self.record_pool_error(
                    &worker.worker_pool_id,
                    PoolError::new(
                        PoolErrorKind::CreationError,
                        "Worker resource creation failed",
                        reason.clone(),
                        json!({ "workerId": worker.worker_id }),
                    ),
                );
                self.persist(worker).await?;
                self.remove_worker(worker, &reason).await
            }
            Err(error) => {
                // unexpected cloud failure: report and tear down
                self.record_pool_error(
                    &worker.worker_pool_id,
                    PoolError::new(
                        PoolErrorKind::CreationError,
                        "Worker resource creation failed",
                        error.to_string(),
                        json!({ "workerId": worker.worker_id }),
                    ),
                );
                self.persist(worker).await?;
                self.remove_worker(worker, "resource creation failed").await
            }
        }
    }

    /// Reverse-order removal: vm, then nic, then ip, then every disk.
    /// Returns true once everything is verified gone.
    async fn removal_step(&self, azure: &mut AzureWorkerData) -> Result<bool, CloudError> {
        azure.migrate_legacy_disk();

        if !remove_resource(self.api.as_ref(), ResourceKind::Vm, &mut azure.vm.resource).await? {
            return Ok(false);
        }
        if !remove_resource(self.api.as_ref(), ResourceKind::Nic, &mut azure.nic).await? {
            return Ok(false);
        }
        if !remove_resource(self.api.as_ref(), ResourceKind::PublicIp, &mut azure.ip).await? {
            return Ok(false);
        }

        let mut all_gone = true;
        for disk in azure.disks.iter_mut() {
            let gone = remove_resource(self.api.as_ref(), ResourceKind::Disk, disk).await?;
            all_gone &= gone && disk.id.is_none();
        }
        Ok(all_gone)
    }

    async fn fetch_instance_power_states(&self, vm_name: &str) -> Result<Vec<String>, CloudError> {
        let view = self.api.instance_view(vm_name).await?;
        Ok(view.as_ref().map(power_states).unwrap_or_default())
    }

    /// Classify a worker whose VM answered the GET.
    async fn check_live_worker(
        &self,
        worker: &mut Worker,
        provisioning_state: Option<String>,
        observed_power_states: Vec<String>,
    ) -> ProviderResult<()> {
        let now = Utc::now();
        let healthy_provisioning = matches!(
            provisioning_state.as_deref(),
            Some(s) if HEALTHY_PROVISIONING_STATES.contains(&s)
        );
        let healthy_power = observed_power_states
            .iter()
            .any(|code| HEALTHY_POWER_STATES.contains(&code.as_str()));
        let failed_power = observed_power_states
            .iter()
            .any(|code| FAIL_POWER_STATES.contains(&code.as_str()));

        if healthy_provisioning && healthy_power {
            *self
                .seen
                .entry(worker.worker_pool_id.clone())
                .or_insert(0) += u64::from(worker.capacity);

            let terminate_after = azure_data(worker)?.terminate_after;
            if let Some(deadline) = terminate_after {
                if deadline <= now.timestamp_millis() {
                    return self.remove_worker(worker, "terminateAfter time exceeded").await;
                }
            }

            if worker.expires < now + Duration::days(EXPIRY_EXTENSION_THRESHOLD_DAYS) {
                worker.extend_expiry(now + Duration::days(EXPIRY_EXTENSION_DAYS));
            }
            self.persist(worker).await?;
            return Ok(());
        }

        if is_fail_provisioning_state(provisioning_state.as_deref()) || failed_power {
            let reason = format!(
                "vm is in an unhealthy state: provisioningState={}, powerStates={:?}",
                provisioning_state.as_deref().unwrap_or("unknown"),
                observed_power_states,
            );
            return self.remove_worker(worker, &reason).await;
        }

        // neither healthy nor failed: surface it, change nothing
        self.record_pool_error(
            &worker.worker_pool_id,
            PoolError::new(
                PoolErrorKind::CreationError,
                "Unknown VM provisioningState or powerStates",
                format!(
                    "provisioningState={}, powerStates={:?}",
                    provisioning_state.as_deref().unwrap_or("unknown"),
                    observed_power_states,
                ),
                json!({ "workerId": worker.worker_id }),
            ),
        );
        self.persist(worker).await?;
        Ok(())
    }

    /// Log a registration refusal and hand back the uniform opaque error.
    fn refuse_registration(&self, worker: &Worker, detail: &str) -> ProviderError {
        warn!(
            event = "registration-error-warning",
            worker_pool_id = %worker.worker_pool_id,
            worker_group = %worker.worker_group,
            worker_id = %worker.worker_id,
            detail,
            "worker registration rejected"
        );
        ProviderError::SignatureValidation
    }
}

#[async_trait]
impl WorkerProvider for AzureProvider {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn setup(&self) -> ProviderResult<()> {
        if self.verifier.initialized() {
            return Ok(());
        }
        let verifier = AttestationVerifier::load_from_dir(&self.ca_cert_dir).map_err(|error| {
            ProviderError::Domain(DomainError::InfrastructureError {
                message: format!("failed to load attestation CA store: {}", error),
            })
        })?;
        let _ = self.verifier.set(verifier);
        Ok(())
    }

    async fn provision(&self, pool: &WorkerPool, demand: &PoolDemand) -> ProviderResult<()> {
        let estimate = self
            .estimator
            .to_spawn(EstimateRequest {
                min_capacity: pool.config.min_capacity,
                max_capacity: pool.config.max_capacity,
                existing_capacity: demand.existing_capacity,
                requested_capacity: demand.requested_capacity,
            })
            .await?;
        if estimate == 0 {
            return Ok(());
        }
        if pool.config.launch_configs.is_empty() {
            return Err(ProviderError::Domain(DomainError::NoLaunchConfigs {
                worker_pool_id: pool.worker_pool_id.clone(),
            }));
        }

        let mut to_spawn = i64::from(estimate);
        while to_spawn > 0 {
            let launch = {
                let mut rng = rand::thread_rng();
                pool.config.launch_configs.choose(&mut rng).cloned()
            };
            let launch = match launch {
                Some(launch) => launch,
                None => break,
            };
            to_spawn -= i64::from(launch.capacity_per_instance.max(1));
            self.create_worker(pool, &launch).await?;
        }
        Ok(())
    }

    async fn deprovision(&self, pool: &WorkerPool) -> ProviderResult<()> {
        // nothing to do: workers terminate themselves and the scanner
        // reaps them
        info!(
            worker_pool_id = %pool.worker_pool_id,
            "pool scheduled for deletion, waiting for workers to drain"
        );
        Ok(())
    }

    async fn register_worker(
        &self,
        _pool: &WorkerPool,
        worker: &Worker,
        proof: &IdentityProof,
    ) -> ProviderResult<RegistrationOutcome> {
        let verifier = match self.verifier.get() {
            Some(verifier) => verifier,
            None => return Err(self.refuse_registration(worker, "provider is not set up")),
        };

        let payload = match verifier.verify_document(&proof.document) {
            Ok(payload) => payload,
            Err(error) => {
                return Err(self.refuse_registration(worker, &format!("document rejected: {}", error)))
            }
        };
        let document_expires = match payload.expires_on() {
            Ok(expires) => expires,
            Err(error) => {
                return Err(self.refuse_registration(worker, &format!("bad timestamp: {}", error)))
            }
        };

        let azure = azure_data(worker)?;

        // learn the vmId if this record never saw its VM created
        let stored_vm_id = match &azure.vm.vm_id {
            Some(vm_id) => vm_id.clone(),
            None => {
                let resource = self
                    .api
                    .get_resource(ResourceKind::Vm, &azure.vm.resource.name)
                    .await
                    .map_err(|e| self.refuse_registration(worker, &format!("vm lookup failed: {}", e)))?;
                let vm_id = resource.and_then(|r| r.vm_id());
                match vm_id {
                    Some(vm_id) => {
                        let key = worker.key();
                        let learned = vm_id.clone();
                        self.workers
                            .update(
                                &key,
                                Box::new(move |row| {
                                    if let Some(azure) = row.provider_data.as_azure_mut() {
                                        azure.vm.vm_id = Some(learned);
                                    }
                                }),
                            )
                            .await
                            .map_err(ProviderError::Domain)?;
                        vm_id
                    }
                    None => {
                        return Err(self.refuse_registration(worker, "vm not found or has no vmId"))
                    }
                }
            }
        };

        if payload.vm_id != stored_vm_id {
            return Err(self.refuse_registration(
                worker,
                &format!(
                    "vmId mismatch: document says {}, record says {}",
                    payload.vm_id, stored_vm_id
                ),
            ));
        }

        let now = Utc::now();
        if document_expires <= now {
            return Err(self.refuse_registration(
                worker,
                &format!("document expired at {}", document_expires),
            ));
        }

        if worker.state != WorkerState::Requested {
            return Err(self.refuse_registration(
                worker,
                &format!("worker is already in state {}", worker.state),
            ));
        }

        let expires = match azure.reregistration_timeout {
            Some(millis) => now + Duration::milliseconds(millis),
            None => now + Duration::hours(DEFAULT_REGISTRATION_LIFETIME_HOURS),
        };

        // flip to running atomically; a concurrent registration loses here
        let applied = Arc::new(AtomicBool::new(false));
        let applied_in_closure = applied.clone();
        let expires_ms = expires.timestamp_millis();
        let updated = self
            .workers
            .update(
                &worker.key(),
                Box::new(move |row| {
                    if row.state == WorkerState::Requested {
                        let _ = row.set_state(WorkerState::Running, now);
                        if let Some(azure) = row.provider_data.as_azure_mut() {
                            azure.terminate_after = Some(expires_ms);
                        }
                        applied_in_closure.store(true, Ordering::SeqCst);
                    }
                }),
            )
            .await
            .map_err(ProviderError::Domain)?;

        if !applied.load(Ordering::SeqCst) {
            return Err(self.refuse_registration(worker, "duplicate registration"));
        }

        info!(
            event = "worker-running",
            worker_pool_id = %updated.worker_pool_id,
            worker_group = %updated.worker_group,
            worker_id = %updated.worker_id,
            expires = %expires,
            "worker registered and running"
        );

        let worker_config = azure_data(&updated)?.worker_config.clone();
        Ok(RegistrationOutcome {
            expires,
            worker_config,
        })
    }

    async fn scan_prepare(&self) -> ProviderResult<()> {
        self.seen.clear();
        self.errors.clear();
        Ok(())
    }

    async fn check_worker(&self, worker: &Worker) -> ProviderResult<()> {
        if worker.state == WorkerState::Stopped {
            return Ok(());
        }

        let mut worker = worker.clone();
        worker.last_checked = Utc::now();

        azure_data_mut(&mut worker)?.migrate_legacy_disk();

        if worker.state == WorkerState::Stopping {
            return self.remove_worker(&worker, "continuing removal").await;
        }

        // a requested worker whose VM id is still unrecorded is mid-pipeline;
        // the pipeline's own GETs record ids as resources turn up
        if worker.state == WorkerState::Requested
            && azure_data(&worker)?.vm.resource.id.is_none()
        {
            return self.drive_provisioning(&mut worker).await;
        }

        let vm_name = azure_data(&worker)?.vm.resource.name.clone();
        let vm = self
            .api
            .get_resource(ResourceKind::Vm, &vm_name)
            .await
            .map_err(cloud_error)?;

        match vm {
            Some(resource) => {
                {
                    let azure = azure_data_mut(&mut worker)?;
                    if azure.vm.vm_id.is_none() {
                        azure.vm.vm_id = resource.vm_id();
                    }
                }
                let provisioning_state = resource.provisioning_state().map(str::to_string);
                let observed = self
                    .fetch_instance_power_states(&vm_name)
                    .await
                    .map_err(cloud_error)?;
                self.check_live_worker(&mut worker, provisioning_state, observed)
                    .await
            }
            None => match worker.state {
                WorkerState::Requested => self.drive_provisioning(&mut worker).await,
                _ => self.remove_worker(&worker, "vm not found").await,
            },
        }
    }

    async fn scan_cleanup(&self) -> ProviderResult<()> {
        for entry in self.seen.iter() {
            info!(
                event = "scan-seen",
                worker_pool_id = %entry.key(),
                seen_capacity = *entry.value(),
                "scan pass capacity"
            );
        }

        let pool_errors: Vec<(WorkerPoolId, Vec<PoolError>)> = self
            .errors
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        self.errors.clear();

        for (worker_pool_id, errors) in pool_errors {
            // pools deleted mid-pass no longer have anywhere to report to
            let pool = self.pools.get(&worker_pool_id).await?;
            if pool.is_none() {
                continue;
            }
            for error in errors {
                if let Err(report_error) = self.reporter.report(&worker_pool_id, error).await {
                    warn!(
                        worker_pool_id = %worker_pool_id,
                        error = %report_error,
                        "failed to report pool error"
                    );
                }
            }
        }
        Ok(())
    }

    async fn remove_worker(&self, worker: &Worker, reason: &str) -> ProviderResult<()> {
        if worker.state == WorkerState::Stopped {
            return Ok(());
        }

        let mut worker = worker.clone();
        let now = Utc::now();
        worker.last_checked = now;

        if worker.state != WorkerState::Stopping {
            info!(
                event = "worker-removed",
                worker_pool_id = %worker.worker_pool_id,
                worker_group = %worker.worker_group,
                worker_id = %worker.worker_id,
                reason,
                "removing worker"
            );
        }

        let verdict = {
            let azure = azure_data_mut(&mut worker)?;
            self.removal_step(azure).await
        };

        match verdict {
            Ok(true) => {
                let _ = worker.set_state(WorkerState::Stopped, now);
            }
            Ok(false) => {
                if worker.state != WorkerState::Stopping {
                    let _ = worker.set_state(WorkerState::Stopping, now);
                }
            }
            Err(error) => {
                // deletion failures are reported and retried next pass
                self.record_pool_error(
                    &worker.worker_pool_id,
                    PoolError::new(
                        PoolErrorKind::DeletionError,
                        "Worker resource deletion failed",
                        error.to_string(),
                        json!({ "workerId": worker.worker_id }),
                    ),
                );
                if worker.state != WorkerState::Stopping {
                    let _ = worker.set_state(WorkerState::Stopping, now);
                }
            }
        }

        self.persist(&worker).await?;
        Ok(())
    }
}
