// src/bin/scan_duplicates.rs
use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use std::collections::BTreeSet;
use std::sync::Arc;

use dedupe_lib::store::{EntityStore, PgStore};
use dedupe_lib::utils::db_connect::connect;
use dedupe_lib::utils::env::load_env;
use dedupe_lib::utils::logging::{MergeLogger, MergeOperation};
use dedupe_lib::utils::merge_config::MergeConfig;
use dedupe_lib::{EntityKind, MergeError, MergeService, SearchStrategy};

#[derive(Parser)]
#[command(author, version, about = "Report likely duplicate pairs across the CRM", long_about = None)]
struct Args {
    /// contact or company
    #[arg(long, default_value = "contact")]
    kind: String,

    /// name, email, phone, linkedin, website or domain
    #[arg(long, default_value = "name")]
    strategy: String,

    /// Ids fetched per page
    #[arg(long, default_value_t = 500)]
    page_size: usize,

    /// Stop after this many records
    #[arg(long)]
    limit: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    load_env();
    let args = Args::parse();

    let kind: EntityKind = args.kind.parse()?;
    let strategy: SearchStrategy = args.strategy.parse()?;
    let config = MergeConfig::from_env();
    config.log_config();

    let pool = connect(&config).await.context("Failed to connect to database")?;
    let store = Arc::new(PgStore::new(pool));
    let service = MergeService::new(store.clone(), store.clone(), config);
    let logger = MergeLogger::new(MergeOperation::Scan);
    logger.log_start(&format!("{} by {}", kind.table(), strategy));

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {pos} scanned {msg}")
            .unwrap(),
    );

    // unordered pairs already reported
    let mut reported: BTreeSet<(String, String)> = BTreeSet::new();
    let mut skipped = 0usize;
    let mut merged = 0usize;
    let mut offset = 0usize;
    let limit = args.limit.unwrap_or(usize::MAX);

    'pages: loop {
        let ids = store
            .list_ids(kind, args.page_size, offset)
            .await
            .context("Failed to list record ids")?;
        if ids.is_empty() {
            break;
        }
        offset += ids.len();

        for id in ids {
            if pb.position() as usize >= limit {
                break 'pages;
            }
            pb.inc(1);
            let candidates = match service.scan_candidates(kind, &id, strategy).await {
                Ok(Some(candidates)) => candidates,
                Ok(None) => {
                    merged += 1;
                    continue;
                }
                Err(MergeError::InsufficientSearchInput { .. }) => {
                    skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!("Search for {} failed: {}", id, e);
                    skipped += 1;
                    continue;
                }
            };
            for candidate in candidates {
                let pair = if id < candidate.entity.id {
                    (id.clone(), candidate.entity.id.clone())
                } else {
                    (candidate.entity.id.clone(), id.clone())
                };
                if reported.insert(pair) {
                    pb.println(format!(
                        "{}\t{}\t{:.2}\t{}",
                        id, candidate.entity.id, candidate.score, candidate.reason
                    ));
                }
            }
            pb.set_message(format!("({} pairs)", reported.len()));
        }
    }

    pb.finish_and_clear();
    info!(
        "Scanned {} {} ({} already merged, {} without usable search input or failed)",
        pb.position(),
        kind.table(),
        merged,
        skipped
    );
    logger.log_completion(&format!("{} likely duplicate pairs", reported.len()));
    Ok(())
}
