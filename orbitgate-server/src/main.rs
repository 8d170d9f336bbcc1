// orbitgate object admission server

use anyhow::Context;
use clap::Parser;
use orbitgate_core::PipelineConfig;
use orbitgate_server::{create_router, ApiState, Services};
use std::path::PathBuf;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "orbitgate-server", version, about = "Object admission pipeline server")]
struct Args {
    /// TOML configuration file; defaults are used when it does not exist
    #[arg(short, long, default_value = "orbitgate.toml")]
    config: PathBuf,

    /// Override the configured bind address
    #[arg(long)]
    bind: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_json);

    info!("Starting orbitgate...");

    if !args.config.exists() {
        warn!(
            "Config file {} not found, using defaults",
            args.config.display()
        );
    }
    let mut config = PipelineConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    let bind = config.server.bind.clone();
    let detector_config = config.detector.clone();

    let services = Services::build(config)
        .await
        .context("initializing services")?;
    services.start();
    info!("Services ready");

    let app = create_router(ApiState::new(services.brain.clone(), detector_config));
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {}", bind))?;
    info!("HTTP server listening on http://{}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown())
        .await
        .context("HTTP server failed")?;

    let report = services.shutdown().await.context("shutting down persistence")?;
    info!("Shutdown complete ({} records flushed)", report.total());
    Ok(())
}

/// Wait for shutdown signal
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
