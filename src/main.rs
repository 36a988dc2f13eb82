use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use llm_gateway::app_state::AppState;
use llm_gateway::config::Config;

#[derive(Parser)]
#[command(name = "llm-gateway")]
#[command(about = "LLM API reverse proxy with AIMD concurrency control", long_about = None)]
struct Cli {
    /// Path to the gateway config file
    #[arg(short, long, env = "GATEWAY_CONFIG", default_value = "~/.llm-gateway/config.json")]
    config: String,

    /// Server host override (defaults to the config file's `host`)
    #[arg(long)]
    host: Option<String>,

    /// Server port override (defaults to the config file's `port`)
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_gateway=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config_path = shellexpand::tilde(&cli.config).to_string();
    let config = Config::from_file(&config_path)?;
    tracing::info!(path = %config_path, "loaded config");

    let host = cli.host.unwrap_or_else(|| config.file().host.clone());
    let port = cli.port.unwrap_or(config.file().port);
    let shutdown_grace_ms = config.file().shutdown_grace_ms;

    let state = AppState::new(config)?;
    state.aimd.start();
    tracing::info!(mode = ?state.aimd.mode(), "aimd controller started");

    let app = llm_gateway::build_router(state.clone());

    let addr = SocketAddr::from((host.parse::<std::net::IpAddr>()?, port));
    tracing::info!(%addr, "llm-gateway listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!(grace_ms = shutdown_grace_ms, "draining in-flight requests");
    tokio::time::sleep(Duration::from_millis(shutdown_grace_ms)).await;
    state.aimd.stop();
    tracing::info!("aimd controller stopped, static limits restored");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
