//! Cirrus worker-manager daemon.
//!
//! Loads settings, wires the Azure provider behind the rate-limited
//! gateway, and runs the provisioning and scanning loops until ctrl-c.
//! The only interesting exit code is a non-zero one for startup failure.

mod seed;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use cirrus_server_application::workers::provisioning::{ProvisioningConfig, ProvisioningService};
use cirrus_server_application::workers::scanner::{ScannerConfig, WorkerScanner};
use cirrus_server_application::{SimpleEstimator, StaticDemand};
use cirrus_server_domain::workers::provider_api::WorkerProvider;
use cirrus_server_infrastructure::persistence::{InMemoryWorkerPoolStore, InMemoryWorkerStore};
use cirrus_server_infrastructure::providers::azure::{ArmClient, AzureProvider, CloudGateway};
use cirrus_server_infrastructure::reporting::LogErrorReporter;
use cirrus_shared::config::ConfigLoader;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let env_file = std::env::var("CIRRUS_ENV_FILE").ok().map(Into::into);
    let settings = ConfigLoader::new(env_file).load_server_settings()?;

    info!(
        provider_id = %settings.azure.provider_id,
        subscription = %settings.azure.subscription_id,
        resource_group = %settings.azure.resource_group_name,
        "starting cirrus worker manager"
    );

    let gateway = Arc::new(CloudGateway::new(
        settings.azure.api_rate_limits,
        Duration::from_millis(settings.azure.backoff_delay_ms),
    ));
    let api = Arc::new(ArmClient::new(settings.azure.clone(), gateway));

    let workers = Arc::new(InMemoryWorkerStore::new());
    let pools = Arc::new(InMemoryWorkerPoolStore::new());
    let reporter = Arc::new(LogErrorReporter::new());
    let estimator = Arc::new(SimpleEstimator::new());

    let provider = Arc::new(
        AzureProvider::builder()
            .with_settings(settings.azure.clone())
            .with_api(api)
            .with_worker_store(workers.clone())
            .with_pool_store(pools.clone())
            .with_reporter(reporter)
            .with_estimator(estimator)
            .build()?,
    );

    // fatal on missing credentials or CA material
    provider.setup().await?;

    seed::load_pools(pools.clone()).await?;

    let mut providers: HashMap<String, Arc<dyn WorkerProvider>> = HashMap::new();
    providers.insert(settings.azure.provider_id.clone(), provider);

    let provisioning = Arc::new(ProvisioningService::new(
        pools,
        workers.clone(),
        providers.clone(),
        Arc::new(StaticDemand::none()),
        ProvisioningConfig {
            tick_interval: Duration::from_secs(settings.provision_interval_secs),
            max_concurrency: settings.max_concurrency,
        },
    ));
    let scanner = Arc::new(WorkerScanner::new(
        workers,
        providers,
        ScannerConfig {
            tick_interval: Duration::from_secs(settings.scan_interval_secs),
            max_concurrency: settings.max_concurrency,
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let provisioning_task = {
        let provisioning = provisioning.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { provisioning.run(shutdown).await })
    };
    let scanner_task = {
        let scanner = scanner.clone();
        let shutdown = shutdown_rx;
        tokio::spawn(async move { scanner.run(shutdown).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, finishing in-flight passes");
    let _ = shutdown_tx.send(true);

    let _ = provisioning_task.await;
    let _ = scanner_task.await;

    info!("cirrus worker manager stopped");
    Ok(())
}
