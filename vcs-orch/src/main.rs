//! vcs-orch - voice conversion orchestrator
//!
//! Accepts conversion, upload and registry requests over HTTP and drives the
//! separate/infer/combine jobs on the remote batch scheduler over SSH.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vcs_common::config::{load_toml_config, resolve_config_path, SshCredentials};
use vcs_orch::mode::SpotifyContextSource;
use vcs_orch::remote::SshConnector;
use vcs_orch::{build_router, AppState};

/// Command-line arguments for vcs-orch
#[derive(Parser, Debug)]
#[command(name = "vcs-orch")]
#[command(about = "Voice conversion orchestrator for a remote batch cluster")]
#[command(version)]
struct Args {
    /// Path to vcstream.toml
    #[arg(short, long, env = "VCS_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides [server].port)
    #[arg(short, long, env = "VCS_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = resolve_config_path(args.config.as_deref());
    let mut config = load_toml_config(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let default_filter = format!("vcs_orch={0},vcs_common={0},tower_http=info", config.logging.level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting vcs-orch v{} (git {}, built {}, {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE"),
    );
    info!("Config: {}", config_path.display());

    let credentials = SshCredentials::from_env().context("SSH credentials are not configured")?;
    info!("Remote host: {}@{}:{}", credentials.user, credentials.host, credentials.port);

    let connector = Arc::new(SshConnector::new(credentials));
    let context_source = Arc::new(
        SpotifyContextSource::new(config.mode.api_base.clone())
            .context("Failed to build playback API client")?,
    );

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", config.server.bind, config.server.port))?;

    let state = AppState::new(config, connector, context_source);
    let mode = state.mode.clone();
    let app = build_router(state);

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if mode.disable().await {
        warn!("Conversion mode was active at shutdown; shared session closed");
    }
    info!("Server shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
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
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
