//! Shared fixtures: a scripted fake of the ARM surface, a collecting
//! error reporter, and a provider harness wired to in-memory stores.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{json, Value};

use cirrus_server_domain::reporting::{ErrorReporter, PoolError};
use cirrus_server_domain::shared_kernel::{Result, WorkerKey, WorkerPoolId};
use cirrus_server_domain::workers::pool_config::{LaunchConfig, LifecyclePolicy, WorkerPoolConfig};
use cirrus_server_domain::workers::provider_api::WorkerProvider;
use cirrus_server_domain::workers::store::{WorkerPoolStore, WorkerStore};
use cirrus_server_domain::workers::{Worker, WorkerPool};
use cirrus_server_infrastructure::persistence::{InMemoryWorkerPoolStore, InMemoryWorkerStore};
use cirrus_server_infrastructure::providers::azure::client::{
    ArmResource, AzureApi, CloudError, CreateStarted, ResourceKind,
};
use cirrus_server_infrastructure::providers::azure::{AttestationVerifier, AzureProvider};
use cirrus_server_application::SimpleEstimator;
use cirrus_shared::config::{ApiRateLimits, AzureSettings};

use openssl::asn1::Asn1Time;
use openssl::hash::MessageDigest;
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::x509::{X509, X509NameBuilder};

/// One recorded cloud call, for ordering and idempotency assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Get(ResourceKind, String),
    Create(ResourceKind, String),
    Delete(ResourceKind, String),
    InstanceView(String),
    Operation(String),
}

#[derive(Default)]
struct FakeState {
    /// Live resources, keyed by kind + name
    resources: HashMap<(ResourceKind, String), Value>,
    /// Bodies of creates that have been requested but not yet finished
    pending_creates: HashMap<(ResourceKind, String), Value>,
    /// Resources with a delete requested but not yet finished
    deleting: HashSet<(ResourceKind, String)>,
    instance_views: HashMap<String, Value>,
    operations: HashMap<String, Value>,
    calls: Vec<Call>,
    op_counter: u64,
}

/// Scripted ARM fake. Creates and deletes are asynchronous: nothing
/// happens until the test calls `finish_create` / `finish_delete`.
#[derive(Default)]
pub struct FakeAzure {
    state: Mutex<FakeState>,
}

impl FakeAzure {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn fake_id(kind: ResourceKind, name: &str) -> String {
        format!("/fake/{}/{}", kind.arm_segment(), name)
    }

    /// Materialise a pending create as a succeeded resource.
    pub fn finish_create(&self, kind: ResourceKind, name: &str) {
        self.finish_create_with(kind, name, json!({}));
    }

    /// Materialise a pending create, merging `extra_properties` into the
    /// resource's `properties` (e.g. `vmId`, cloud-named disks).
    pub fn finish_create_with(&self, kind: ResourceKind, name: &str, extra_properties: Value) {
        let mut state = self.state.lock().unwrap();
        let body = state
            .pending_creates
            .remove(&(kind, name.to_string()))
            .unwrap_or_else(|| json!({}));

        let mut properties = body.get("properties").cloned().unwrap_or_else(|| json!({}));
        properties["provisioningState"] = json!("Succeeded");
        if let (Some(properties), Some(extra)) =
            (properties.as_object_mut(), extra_properties.as_object())
        {
            for (key, value) in extra {
                properties.insert(key.clone(), value.clone());
            }
        }

        let mut resource = body;
        resource["id"] = json!(Self::fake_id(kind, name));
        resource["name"] = json!(name);
        resource["properties"] = properties;

        state.resources.insert((kind, name.to_string()), resource);
        Self::finish_operations(&mut state, kind, name, json!({ "status": "Succeeded" }));
    }

    /// Plant a resource with the given provisioning state (no create
    /// needed first).
    pub fn plant_resource(&self, kind: ResourceKind, name: &str, provisioning_state: &str) {
        let mut state = self.state.lock().unwrap();
        state.resources.insert(
            (kind, name.to_string()),
            json!({
                "id": Self::fake_id(kind, name),
                "name": name,
                "properties": { "provisioningState": provisioning_state }
            }),
        );
    }

    /// Overwrite a resource's provisioning state in place.
    pub fn set_provisioning_state(&self, kind: ResourceKind, name: &str, value: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(resource) = state.resources.get_mut(&(kind, name.to_string())) {
            resource["properties"]["provisioningState"] = json!(value);
        }
    }

    /// Complete a requested delete: the resource disappears.
    pub fn finish_delete(&self, kind: ResourceKind, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.resources.remove(&(kind, name.to_string()));
        state.deleting.remove(&(kind, name.to_string()));
        Self::finish_operations(&mut state, kind, name, json!({ "status": "Succeeded" }));
    }

    /// Mark the newest operation for this resource as failed.
    pub fn fail_operation(&self, kind: ResourceKind, name: &str, message: &str) {
        let mut state = self.state.lock().unwrap();
        let body = json!({ "status": "Failed", "error": { "message": message } });
        Self::finish_operations(&mut state, kind, name, body);
        // the create never materialises
        state.pending_creates.remove(&(kind, name.to_string()));
    }

    fn finish_operations(state: &mut FakeState, kind: ResourceKind, name: &str, body: Value) {
        let prefix = format!("https://management.test/operations/{}/{}/", kind.display(), name);
        let urls: Vec<String> = state
            .operations
            .keys()
            .filter(|url| url.starts_with(&prefix))
            .cloned()
            .collect();
        for url in urls {
            state.operations.insert(url, body.clone());
        }
    }

    pub fn set_instance_view(&self, vm_name: &str, power_codes: &[&str]) {
        let statuses: Vec<Value> = power_codes.iter().map(|code| json!({ "code": code })).collect();
        self.state
            .lock()
            .unwrap()
            .instance_views
            .insert(vm_name.to_string(), json!({ "statuses": statuses }));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count_calls(&self, wanted: &Call) -> usize {
        self.calls().iter().filter(|call| *call == wanted).count()
    }

    /// Body of the most recent create request for a resource.
    pub fn create_body(&self, kind: ResourceKind, name: &str) -> Option<Value> {
        self.state
            .lock()
            .unwrap()
            .pending_creates
            .get(&(kind, name.to_string()))
            .cloned()
    }
}

#[async_trait]
impl AzureApi for FakeAzure {
    async fn get_resource(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> std::result::Result<Option<ArmResource>, CloudError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Get(kind, name.to_string()));
        Ok(state
            .resources
            .get(&(kind, name.to_string()))
            .cloned()
            .map(ArmResource::new))
    }

    async fn begin_create_or_update(
        &self,
        kind: ResourceKind,
        name: &str,
        body: Value,
    ) -> std::result::Result<CreateStarted, CloudError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Create(kind, name.to_string()));
        state.op_counter += 1;
        let url = format!(
            "https://management.test/operations/{}/{}/{}",
            kind.display(),
            name,
            state.op_counter
        );
        state
            .operations
            .insert(url.clone(), json!({ "status": "InProgress" }));
        state
            .pending_creates
            .insert((kind, name.to_string()), body.clone());
        Ok(CreateStarted {
            resource: ArmResource::new(body),
            operation_url: Some(url),
        })
    }

    async fn begin_delete(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> std::result::Result<Option<String>, CloudError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Delete(kind, name.to_string()));
        if !state.resources.contains_key(&(kind, name.to_string())) {
            return Ok(None);
        }
        state.deleting.insert((kind, name.to_string()));
        state.op_counter += 1;
        let url = format!(
            "https://management.test/operations/{}/{}/{}",
            kind.display(),
            name,
            state.op_counter
        );
        state
            .operations
            .insert(url.clone(), json!({ "status": "InProgress" }));
        Ok(Some(url))
    }

    async fn instance_view(
        &self,
        vm_name: &str,
    ) -> std::result::Result<Option<Value>, CloudError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::InstanceView(vm_name.to_string()));
        Ok(state.instance_views.get(vm_name).cloned())
    }

    async fn get_operation(
        &self,
        operation_url: &str,
    ) -> std::result::Result<Option<Value>, CloudError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Operation(operation_url.to_string()));
        Ok(state.operations.get(operation_url).cloned())
    }
}

/// [`ErrorReporter`] that captures everything for assertions.
#[derive(Default)]
pub struct CollectingReporter {
    pub reports: Mutex<Vec<(WorkerPoolId, PoolError)>>,
}

impl CollectingReporter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .map(|(_, error)| error.kind.as_str())
            .collect()
    }
}

#[async_trait]
impl ErrorReporter for CollectingReporter {
    async fn report(&self, worker_pool_id: &WorkerPoolId, error: PoolError) -> Result<()> {
        self.reports
            .lock()
            .unwrap()
            .push((worker_pool_id.clone(), error));
        Ok(())
    }
}

/// Throwaway signing CA for attestation tests.
pub struct TestCa {
    pub certificate: X509,
    pub key: PKey<Private>,
}

impl TestCa {
    pub fn generate() -> Self {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "cirrus test intermediate")
            .unwrap();
        let name = name.build();

        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(7).unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();

        Self {
            certificate: builder.build(),
            key,
        }
    }

    pub fn verifier(&self) -> AttestationVerifier {
        AttestationVerifier::from_certificates(vec![self.certificate.clone()]).unwrap()
    }

    /// Sign `payload` into a base64 PKCS#7 attested document.
    pub fn sign_document(&self, payload: &Value) -> String {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine;

        let certs = Stack::new().unwrap();
        let pkcs7 = Pkcs7::sign(
            &self.certificate,
            &self.key,
            &certs,
            payload.to_string().as_bytes(),
            Pkcs7Flags::empty(),
        )
        .unwrap();
        BASE64.encode(pkcs7.to_der().unwrap())
    }
}

/// Fully wired provider over fakes and in-memory stores.
pub struct Harness {
    pub api: Arc<FakeAzure>,
    pub workers: Arc<InMemoryWorkerStore>,
    pub pools: Arc<InMemoryWorkerPoolStore>,
    pub reporter: Arc<CollectingReporter>,
    pub provider: AzureProvider,
    pub pool: WorkerPool,
    pub ca: TestCa,
}

pub fn test_settings() -> AzureSettings {
    AzureSettings {
        provider_id: "azure-central".to_string(),
        root_url: "https://cirrus.example.com".to_string(),
        client_id: "client".to_string(),
        secret: "secret".to_string(),
        domain: "example.onmicrosoft.com".to_string(),
        subscription_id: "sub".to_string(),
        resource_group_name: "rg-workers".to_string(),
        storage_account_name: None,
        ca_cert_dir: "/nonexistent".into(),
        api_rate_limits: ApiRateLimits::default(),
        backoff_delay_ms: 1,
    }
}

pub fn test_pool(lifecycle: LifecyclePolicy) -> WorkerPool {
    WorkerPool::new(
        WorkerPoolId::new("builds/linux-large").unwrap(),
        "azure-central",
        "releng@example.com",
        WorkerPoolConfig {
            min_capacity: 1,
            max_capacity: 4,
            lifecycle,
            launch_configs: vec![LaunchConfig {
                capacity_per_instance: 1,
                location: "westus".to_string(),
                subnet_id: "/fake/subnets/workers".to_string(),
                hardware_profile: json!({ "vmSize": "Basic_A2" }),
                storage_profile: json!({
                    "imageReference": { "id": "/fake/images/worker" },
                    "osDisk": { "name": "user-supplied-os", "createOption": "FromImage" },
                    "dataDisks": [{ "name": "user-supplied-data", "lun": 0, "createOption": "Empty" }]
                }),
                os_profile: None,
                network_profile: None,
                billing_profile: None,
                tags: HashMap::from([
                    ("team".to_string(), "releng".to_string()),
                    ("owner".to_string(), "spoofed@example.com".to_string()),
                ]),
                worker_config: json!({ "shutdownBehavior": "terminate" }),
            }],
        },
        Utc::now(),
    )
}

pub async fn harness() -> Harness {
    harness_with_lifecycle(LifecyclePolicy::default()).await
}

pub async fn harness_with_lifecycle(lifecycle: LifecyclePolicy) -> Harness {
    let api = FakeAzure::new();
    let workers = Arc::new(InMemoryWorkerStore::new());
    let pools = Arc::new(InMemoryWorkerPoolStore::new());
    let reporter = CollectingReporter::new();
    let ca = TestCa::generate();

    let provider = AzureProvider::builder()
        .with_settings(test_settings())
        .with_api(api.clone())
        .with_worker_store(workers.clone())
        .with_pool_store(pools.clone())
        .with_reporter(reporter.clone())
        .with_estimator(Arc::new(SimpleEstimator::new()))
        .with_verifier(ca.verifier())
        .build()
        .unwrap();

    let pool = pools.create(test_pool(lifecycle)).await.unwrap();

    Harness {
        api,
        workers,
        pools,
        reporter,
        provider,
        pool,
        ca,
    }
}

impl Harness {
    /// Fetch the single worker of the harness pool.
    pub async fn only_worker(&self) -> Worker {
        let workers = self
            .workers
            .list_by_pool(&self.pool.worker_pool_id)
            .await
            .unwrap();
        assert_eq!(workers.len(), 1, "expected exactly one worker");
        workers.into_iter().next().unwrap()
    }

    /// Run one scanner-equivalent check over the (fresh) worker row.
    pub async fn check(&self, key: &WorkerKey) {
        let worker = self.workers.get(key).await.unwrap().unwrap();
        self.provider.check_worker(&worker).await.unwrap();
    }

    pub async fn fresh(&self, key: &WorkerKey) -> Worker {
        self.workers.get(key).await.unwrap().unwrap()
    }

    /// Shift a worker into a given state bypassing the cloud (test setup).
    pub async fn force_state(
        &self,
        key: &WorkerKey,
        mutate: impl FnOnce(&mut Worker) + Send + 'static,
    ) -> Worker {
        self.workers.update(key, Box::new(mutate)).await.unwrap()
    }
}

/// Shape of a directly seeded worker row (bypassing provision).
pub struct SeedWorker {
    pub state: cirrus_shared::WorkerState,
    pub with_resource_ids: bool,
    pub vm_id: Option<String>,
    pub disks: Vec<cirrus_server_domain::workers::provider_data::ResourceRecord>,
    pub legacy_disk: Option<cirrus_server_domain::workers::provider_data::ResourceRecord>,
    pub terminate_after: Option<i64>,
    pub reregistration_timeout: Option<i64>,
    pub expires: Option<chrono::DateTime<Utc>>,
}

impl Default for SeedWorker {
    fn default() -> Self {
        Self {
            state: cirrus_shared::WorkerState::Requested,
            with_resource_ids: false,
            vm_id: None,
            disks: Vec::new(),
            legacy_disk: None,
            terminate_after: None,
            reregistration_timeout: None,
            expires: None,
        }
    }
}

/// Insert a worker row directly into the store, with resources optionally
/// pre-planted in the fake cloud.
pub async fn seed_worker(h: &Harness, seed: SeedWorker) -> Worker {
    use cirrus_server_domain::workers::provider_data::{
        AzureWorkerData, ProviderData, ResourceRecord, VmRecord,
    };
    use cirrus_shared::WorkerState;

    let now = Utc::now();
    let vm_name = "vm-seeded-worker";
    let mut vm_resource = ResourceRecord::new(vm_name);
    let mut ip = ResourceRecord::new("pip-seeded");
    let mut nic = ResourceRecord::new("nic-seeded");
    if seed.with_resource_ids {
        vm_resource.id = Some(format!("/fake/vm/{}", vm_name));
        ip.id = Some("/fake/ip/pip-seeded".to_string());
        nic.id = Some("/fake/nic/nic-seeded".to_string());
    }

    let data = AzureWorkerData {
        location: "westus".to_string(),
        resource_group_name: "rg-workers".to_string(),
        subnet_id: "/fake/subnets/workers".to_string(),
        tags: HashMap::new(),
        vm: VmRecord {
            resource: vm_resource,
            computer_name: "seededhost".to_string(),
            config: json!({ "hardwareProfile": { "vmSize": "Basic_A2" } }),
            vm_id: seed.vm_id,
        },
        ip,
        nic,
        disks: seed.disks,
        disk: seed.legacy_disk,
        terminate_after: seed.terminate_after,
        reregistration_timeout: seed.reregistration_timeout,
        worker_config: json!({ "shutdownBehavior": "terminate" }),
    };

    let worker = Worker::new(
        h.pool.worker_pool_id.clone(),
        "azure-central",
        "westus",
        vm_name,
        1,
        seed.expires.unwrap_or_else(week_from_now),
        ProviderData::Azure(data),
        now,
    )
    .unwrap();
    let worker = h.workers.create(worker).await.unwrap();

    let target = seed.state;
    if target != WorkerState::Requested {
        h.workers
            .update(
                &worker.key(),
                Box::new(move |row| {
                    if target == WorkerState::Stopped {
                        let _ = row.set_state(WorkerState::Stopping, now);
                        let _ = row.set_state(WorkerState::Stopped, now);
                    } else {
                        let _ = row.set_state(target, now);
                    }
                }),
            )
            .await
            .unwrap();
    }
    h.fresh(&worker.key()).await
}

/// Names recorded on a freshly provisioned worker.
pub fn resource_names(worker: &Worker) -> (String, String, String) {
    let azure = worker.azure_data().unwrap();
    (
        azure.ip.name.clone(),
        azure.nic.name.clone(),
        azure.vm.resource.name.clone(),
    )
}

pub fn week_from_now() -> chrono::DateTime<Utc> {
    Utc::now() + Duration::days(7)
}
