// src/main.rs - Merge worker: drains pending merge jobs
use anyhow::{Context, Result};
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

use dedupe_lib::store::PgStore;
use dedupe_lib::utils::db_connect::{connect, get_pool_status};
use dedupe_lib::utils::env::load_env;
use dedupe_lib::utils::merge_config::MergeConfig;
use dedupe_lib::MergeService;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    info!("Starting CRM merge worker");
    load_env();

    let config = MergeConfig::from_env();
    config.log_config();

    let pool = connect(&config).await.context("Failed to connect to database")?;
    let store = Arc::new(PgStore::new(pool.clone()));
    store
        .ensure_merge_job_table()
        .await
        .context("Failed to prepare merge_jobs table")?;

    let batch_size = config.worker_batch_size;
    let idle = Duration::from_secs(config.worker_idle_secs);
    let service = MergeService::new(store.clone(), store, config);

    loop {
        let pass = tokio::select! {
            pass = service.process_pending(batch_size) => pass,
            _ = signal::ctrl_c() => {
                info!("Shutdown requested, stopping worker");
                break;
            }
        };

        let processed = match pass {
            Ok(pass) => {
                if pass.total() > 0 {
                    let (size, available, in_use) = get_pool_status(&pool);
                    info!(
                        "Worker pass: {} completed, {} failed, {} skipped (DB pool {}/{} idle, {} in use)",
                        pass.completed, pass.failed, pass.skipped, available, size, in_use
                    );
                }
                pass.total()
            }
            Err(e) => {
                error!("Worker pass failed: {} ({})", e, e.user_hint());
                0
            }
        };

        // a full batch means there may be more waiting
        if processed < batch_size {
            tokio::select! {
                _ = tokio::time::sleep(idle) => {}
                _ = signal::ctrl_c() => {
                    info!("Shutdown requested, stopping worker");
                    break;
                }
            }
        }
    }

    Ok(())
}
