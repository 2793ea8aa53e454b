use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use flowrun::config;
use flowrun::content::ContentClient;
use flowrun::db;
use flowrun::engine::EngineClient;
use flowrun::reaper;
use flowrun::{Orchestrator, Settings};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Force-terminate stuck runs and close out interrupted submissions, then exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Override orchestrator.zombie_threshold_seconds
    #[arg(long)]
    threshold_seconds: Option<u64>,

    /// Only reap running runs; leave pending runs and batches alone
    #[arg(long)]
    skip_recovery: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let orch = Orchestrator::new(
        pool,
        Arc::new(EngineClient::from_config(&cfg)?),
        Arc::new(ContentClient::from_config(&cfg)?),
        Settings::from_config(&cfg),
    );
    let threshold = args
        .threshold_seconds
        .map(Duration::from_secs)
        .unwrap_or_else(|| cfg.zombie_threshold());

    info!(threshold_secs = threshold.as_secs(), "reaping stuck runs");
    let reaped = reaper::reap(&orch, threshold).await?;
    println!("reaped {reaped} stuck run(s)");

    if !args.skip_recovery {
        let report = reaper::recover_stalled(&orch, threshold).await?;
        println!(
            "recovered {} stalled run(s), aborted {} stalled batch(es)",
            report.stalled_runs, report.aborted_batches
        );
    }
    Ok(())
}
