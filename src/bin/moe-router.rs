// MoE Router - HTTP front door routing requests to expert services

use anyhow::Context;
use clap::Parser;
use moe_router::config::RouterConfig;
use moe_router::orchestration::Orchestrator;
use moe_router::server;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to router configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on (overrides config and PORT)
    #[arg(short, long)]
    bind: Option<String>,

    /// Log filter, e.g. `debug` or `moe_router=trace` (overrides RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = match &args.log_level {
        Some(level) => tracing_subscriber::EnvFilter::try_new(level)
            .with_context(|| format!("invalid log filter '{}'", level))?,
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "moe_router=info,tower_http=info".into()),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = RouterConfig::load(args.config.as_deref())?;
    config.apply_env_overrides();
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    config.validate()?;

    for expert in &config.experts {
        tracing::info!(expert = %expert.id, endpoint = %expert.endpoint, "Registered expert");
    }

    let orchestrator = Arc::new(Orchestrator::with_config(&config)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let refresh = orchestrator
        .registry()
        .clone()
        .spawn_refresh_loop(config.refresh_interval(), shutdown_rx);

    let app = server::router(orchestrator);
    let listener = TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    tracing::info!("MoE router listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutting down");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    refresh.await?;

    Ok(())
}
