mod api;
mod bootstrap;
mod cli;
mod runtime;
mod state;
mod workflow;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use swarm_domain::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            // Config must be resolved before tracing is initialized: the
            // subscriber's default filter is seeded from `LOG_LEVEL`
            // (`observability.log_level`), and a config error reported via
            // `tracing` before the subscriber exists would be silently lost.
            let config = match Config::from_env() {
                Ok(config) => config,
                Err(issues) => {
                    for issue in &issues {
                        eprintln!("{issue}");
                    }
                    anyhow::bail!("configuration invalid, refusing to start");
                }
            };
            init_tracing(&config.observability.log_level);
            run_server(Arc::new(config)).await
        }
        Some(Command::Version) => {
            println!("swarmd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing(log_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{log_level},swarm_gateway=debug,tower_http=info"))
        }))
        .json()
        .init();
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("swarm-engine starting");

    if !config.server.is_loopback() {
        tracing::warn!(
            host = %config.server.host,
            "binding to a non-loopback address exposes the engine beyond this host"
        );
    }

    let state = bootstrap::build_app_state(config.clone())
        .await
        .context("initializing gateway state")?;
    bootstrap::spawn_background_tasks(&state);

    let sandboxes = state.sandboxes.clone();
    let app = api::router(state.clone())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "swarm-engine listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("axum server error")?;

    sandboxes.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
