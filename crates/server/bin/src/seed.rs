//! Optional pool seeding.
//!
//! The pool API that normally owns pool rows is an external collaborator.
//! For standalone runs, `CIRRUS_POOLS_FILE` may point at a JSON array of
//! worker pool definitions which are loaded into the store at startup.

use std::sync::Arc;

use tracing::info;

use cirrus_server_domain::workers::store::WorkerPoolStore;
use cirrus_server_domain::workers::WorkerPool;

pub async fn load_pools(pools: Arc<dyn WorkerPoolStore>) -> anyhow::Result<()> {
    let path = match std::env::var("CIRRUS_POOLS_FILE") {
        Ok(path) => path,
        Err(_) => return Ok(()),
    };

    let raw = std::fs::read_to_string(&path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path, e))?;
    let parsed: Vec<WorkerPool> = serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse {}: {}", path, e))?;

    let count = parsed.len();
    for pool in parsed {
        pools.create(pool).await?;
    }
    info!(count, path, "seeded worker pools");
    Ok(())
}
