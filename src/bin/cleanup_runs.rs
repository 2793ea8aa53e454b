use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use flowrun::config;
use flowrun::content::ContentClient;
use flowrun::db::{self, CleanupFilter};
use flowrun::engine::EngineClient;
use flowrun::model::{RunStatus, Target};
use flowrun::retention;
use flowrun::{Orchestrator, Settings};

#[derive(Debug, Parser)]
#[command(author, version, about = "Delete finished runs matching the given filters")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Only runs created before this RFC 3339 timestamp
    #[arg(long)]
    before: Option<DateTime<Utc>>,

    /// Only runs with this terminal status (success, failed, cancelled)
    #[arg(long, value_parser = parse_status)]
    status: Option<RunStatus>,

    #[arg(long)]
    workflow_key: Option<String>,

    #[arg(long, conflicts_with = "document_id")]
    node_id: Option<String>,

    #[arg(long)]
    document_id: Option<String>,

    /// Also delete force-terminated runs
    #[arg(long)]
    include_zombie: bool,

    /// Report what would be deleted without deleting
    #[arg(long)]
    dry_run: bool,
}

fn parse_status(s: &str) -> Result<RunStatus, String> {
    RunStatus::parse_state(s).ok_or_else(|| format!("unknown run status {s}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if args.before.is_none()
        && args.status.is_none()
        && args.workflow_key.is_none()
        && args.node_id.is_none()
        && args.document_id.is_none()
        && !args.dry_run
    {
        bail!("refusing to delete every finished run; pass a filter or --dry-run");
    }

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

    let target = args
        .node_id
        .map(Target::Node)
        .or(args.document_id.map(Target::Document));
    let filter = CleanupFilter {
        before_date: args.before,
        status: args.status,
        workflow_key: args.workflow_key,
        target,
        include_zombie: args.include_zombie,
        dry_run: args.dry_run,
    };
    let report = retention::cleanup_runs(&orch, &filter).await?;
    if report.dry_run {
        println!(
            "would delete {} run(s), {} of them force-terminated",
            report.deleted_count, report.zombie_count
        );
    } else {
        println!(
            "deleted {} run(s), {} of them force-terminated",
            report.deleted_count, report.zombie_count
        );
    }
    Ok(())
}
