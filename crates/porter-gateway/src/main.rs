use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

mod app;
mod http;
mod reminder;

/// Conversational routing and session-orchestration gateway.
#[derive(Parser, Debug)]
#[command(name = "porter-gateway", version)]
struct Args {
    /// Path to porter.toml (defaults to ./porter.toml; PORTER_* env vars
    /// override file values either way).
    #[arg(long)]
    config: Option<String>,

    /// Override [channels].run_mode (standalone | workchat | webchat).
    #[arg(long)]
    mode: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "porter_gateway=info,porter_orchestrator=info,tower_http=warn".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = porter_core::config::PorterConfig::load(args.config.as_deref())?;
    if let Some(mode) = args.mode {
        config.channels.run_mode = mode;
    }
    config.validate_run_mode()?;

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;

    // Config errors (a mandatory channel without credentials) abort here
    // with the structured listing of missing variables.
    let state = Arc::new(app::AppState::build(config).await?);
    reminder::spawn_reminder_sweep(Arc::clone(&state));

    let router = app::build_router(Arc::clone(&state));
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!(%addr, run_mode = %state.config.channels.run_mode, "porter gateway listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("porter gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received, draining in-flight work");
}
