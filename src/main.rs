use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use flowrun::api::{create_router, AppState};
use flowrun::config;
use flowrun::content::ContentClient;
use flowrun::db;
use flowrun::engine::EngineClient;
use flowrun::reaper::{self, ReaperConfig};
use flowrun::{Orchestrator, Settings};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Print an example config and exit
    #[arg(long)]
    print_example_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if args.print_example_config {
        print!("{}", config::example());
        return Ok(());
    }
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let engine = EngineClient::from_config(&cfg)?;
    let content = ContentClient::from_config(&cfg)?;
    let orch = Orchestrator::new(
        pool,
        Arc::new(engine),
        Arc::new(content),
        Settings::from_config(&cfg),
    );

    let (reaper_handle, reaper_shutdown) = reaper::spawn_reaper(
        orch.clone(),
        ReaperConfig {
            interval: cfg.reap_interval(),
            threshold: cfg.zombie_threshold(),
        },
    );

    let app = create_router(AppState::new(orch, &cfg.engine.callback_secret));
    let addr: SocketAddr = cfg
        .app
        .listen_addr
        .parse()
        .context("invalid app.listen_addr")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "serving orchestrator API");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(?err, "failed to listen for shutdown signal");
            }
            info!("shutdown requested");
        })
        .await
        .context("server error")?;

    let _ = reaper_shutdown.send(true);
    if let Err(err) = reaper_handle.await {
        warn!(?err, "reaper task ended abnormally");
    }
    Ok(())
}
