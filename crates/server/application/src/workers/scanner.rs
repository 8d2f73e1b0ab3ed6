//! Scan loop.
//!
//! Each pass: reset the providers' per-pass accumulators, walk every
//! worker with bounded fan-out, let the owning provider classify it and
//! advance its pipelines, then report what the pass accumulated. A worker
//! already being checked (an overlapping pass) is skipped; one worker's
//! failure never stops the pass. Stopped rows whose expiry has passed are
//! reaped here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use cirrus_server_domain::shared_kernel::{DomainError, WorkerKey, WorkerState};
use cirrus_server_domain::workers::provider_api::WorkerProvider;
use cirrus_server_domain::workers::store::WorkerStore;
use cirrus_server_domain::workers::Worker;

/// Tuning for the scan loop.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Interval between passes
    pub tick_interval: Duration,

    /// Bound on workers checked concurrently
    pub max_concurrency: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(120),
            max_concurrency: 16,
        }
    }
}

/// Result of one scan pass.
#[derive(Debug, Default)]
pub struct ScanPassSummary {
    pub workers_checked: u64,
    pub workers_skipped: u64,
    pub workers_reaped: u64,
    pub failures: u64,
}

pub struct WorkerScanner {
    workers: Arc<dyn WorkerStore>,
    providers: HashMap<String, Arc<dyn WorkerProvider>>,
    config: ScannerConfig,

    /// Row-level claim: a worker present here is being checked right now
    in_flight: DashMap<WorkerKey, ()>,
}

impl WorkerScanner {
    pub fn new(
        workers: Arc<dyn WorkerStore>,
        providers: HashMap<String, Arc<dyn WorkerProvider>>,
        config: ScannerConfig,
    ) -> Self {
        Self {
            workers,
            providers,
            config,
            in_flight: DashMap::new(),
        }
    }

    /// Run until `shutdown` flips to true. The in-flight pass finishes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_secs = self.config.tick_interval.as_secs(),
            "scan loop started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.tick_interval) => {
                    match self.run_once().await {
                        Ok(summary) => debug!(
                            checked = summary.workers_checked,
                            skipped = summary.workers_skipped,
                            reaped = summary.workers_reaped,
                            failures = summary.failures,
                            "scan pass finished"
                        ),
                        Err(error) => error!(%error, "scan pass failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scan loop stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One full pass over all workers.
    pub async fn run_once(&self) -> Result<ScanPassSummary, DomainError> {
        for (provider_id, provider) in &self.providers {
            if let Err(error) = provider.scan_prepare().await {
                warn!(provider_id = %provider_id, %error, "scan_prepare failed");
            }
        }

        let workers = self.workers.list_all().await?;
        let checked = AtomicU64::new(0);
        let skipped = AtomicU64::new(0);
        let reaped = AtomicU64::new(0);
        let failures = AtomicU64::new(0);

        futures::stream::iter(workers)
            .for_each_concurrent(self.config.max_concurrency, |worker| {
                let checked = &checked;
                let skipped = &skipped;
                let reaped = &reaped;
                let failures = &failures;
                async move {
                    match self.scan_worker(worker).await {
                        ScanDisposition::Checked => checked.fetch_add(1, Ordering::Relaxed),
                        ScanDisposition::Skipped => skipped.fetch_add(1, Ordering::Relaxed),
                        ScanDisposition::Reaped => reaped.fetch_add(1, Ordering::Relaxed),
                        ScanDisposition::Failed => failures.fetch_add(1, Ordering::Relaxed),
                    };
                }
            })
            .await;

        for (provider_id, provider) in &self.providers {
            if let Err(error) = provider.scan_cleanup().await {
                warn!(provider_id = %provider_id, %error, "scan_cleanup failed");
            }
        }

        Ok(ScanPassSummary {
            workers_checked: checked.into_inner(),
            workers_skipped: skipped.into_inner(),
            workers_reaped: reaped.into_inner(),
            failures: failures.into_inner(),
        })
    }

    async fn scan_worker(&self, worker: Worker) -> ScanDisposition {
        let key = worker.key();

        if worker.state == WorkerState::Stopped {
            // terminal rows linger until their expiry, then disappear
            if worker.expires <= Utc::now() {
                if let Err(error) = self.workers.delete(&key).await {
                    warn!(worker = %key, %error, "failed to reap expired worker");
                    return ScanDisposition::Failed;
                }
                return ScanDisposition::Reaped;
            }
            return ScanDisposition::Skipped;
        }

        let provider = match self.providers.get(&worker.provider_id) {
            Some(provider) => provider.clone(),
            None => {
                warn!(
                    worker = %key,
                    provider_id = %worker.provider_id,
                    "worker references an unknown provider"
                );
                return ScanDisposition::Skipped;
            }
        };

        if self.in_flight.insert(key.clone(), ()).is_some() {
            // another pass still holds this row
            return ScanDisposition::Skipped;
        }

        let disposition = match provider.check_worker(&worker).await {
            Ok(()) => ScanDisposition::Checked,
            Err(error) => {
                warn!(worker = %key, %error, "check_worker failed");
                ScanDisposition::Failed
            }
        };

        self.in_flight.remove(&key);
        disposition
    }
}

enum ScanDisposition {
    Checked,
    Skipped,
    Reaped,
    Failed,
}
