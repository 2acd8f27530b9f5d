// src/bin/find_duplicates.rs
use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use std::sync::Arc;

use dedupe_lib::store::PgStore;
use dedupe_lib::utils::db_connect::connect;
use dedupe_lib::utils::env::load_env;
use dedupe_lib::utils::merge_config::MergeConfig;
use dedupe_lib::utils::retry::RetryPolicy;
use dedupe_lib::{EntityKind, MergeError, MergeService, SearchStrategy};

#[derive(Parser)]
#[command(author, version, about = "Find duplicates of one CRM record", long_about = None)]
struct Args {
    /// contact or company
    #[arg(long, default_value = "contact")]
    kind: String,

    /// Id of the record to search duplicates for
    #[arg(long)]
    id: String,

    /// name, email, phone, linkedin, website or domain
    #[arg(long, default_value = "name")]
    strategy: String,

    /// Print the proposed merge plan for this candidate
    #[arg(long)]
    plan_with: Option<String>,

    /// Submit the proposed plan and wait for the worker to finish it
    #[arg(long, requires = "plan_with")]
    submit: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    load_env();
    let args = Args::parse();

    let kind: EntityKind = args.kind.parse()?;
    let strategy: SearchStrategy = args.strategy.parse()?;
    let config = MergeConfig::from_env();

    let pool = connect(&config).await.context("Failed to connect to database")?;
    let store = Arc::new(PgStore::new(pool));
    let service = MergeService::new(store.clone(), store, config.clone());

    let candidates = match service.find_candidates(kind, &args.id, strategy).await {
        Ok(candidates) => candidates,
        Err(e @ MergeError::InsufficientSearchInput { .. }) => {
            bail!("{} ({})", e, e.user_hint())
        }
        Err(e) => return Err(e).context("Duplicate search failed"),
    };

    if candidates.is_empty() {
        println!("No {} duplicates found for {} {}", strategy, kind, args.id);
    }
    for candidate in &candidates {
        println!(
            "{:<38} {:<30} {:.2}  {}{}",
            candidate.entity.id,
            candidate.entity.display_name(),
            candidate.score,
            candidate.reason,
            candidate
                .matched_value
                .as_deref()
                .map(|v| format!(" ({})", v))
                .unwrap_or_default()
        );
    }

    let Some(candidate_id) = args.plan_with else {
        return Ok(());
    };
    let plan = service.propose_plan(kind, &args.id, &candidate_id).await?;
    println!("{}", serde_json::to_string_pretty(&plan)?);

    if args.submit {
        let job_id = service.submit_merge(plan).await?;
        info!("Submitted merge job {}", job_id);
        let status = service
            .wait_for_job(job_id, RetryPolicy::from_config(&config))
            .await?;
        println!("Merge job {} is {}", job_id, status);
    }
    Ok(())
}
