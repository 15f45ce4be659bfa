#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # cmder
//!
//! Remote command execution with a forwarding gateway.
//!
//! ## Subcommands
//!
//! - `cmder agent`: run tasks and script sessions on this host
//! - `cmder proxy`: authenticate callers and relay them to named agents
//!
//! Both take `--config <path>`; without it `cmder.toml`, then `config.yaml`
//! in the working directory are tried before falling back to defaults.
//!
//! An invalid configuration aborts startup with exit status 1. Every other
//! failure after startup is handled per request.

use std::net::SocketAddr;

use axum::Router;
use clap::{Parser, Subcommand};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use cmder::config::{self, AgentConfig, ConfigError, ProxyConfig};
use cmder::{AgentContext, ProxyContext};

/// Remote command execution agent and forwarding proxy.
#[derive(Parser)]
#[command(name = "cmder", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent: execute submitted commands and stream their output.
    Agent {
        /// Path to a TOML or YAML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run the proxy: forward requests and WebSocket sessions to agents.
    Proxy {
        /// Path to a TOML or YAML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[derive(Debug, Error)]
enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Agent { config } => run_agent(config.as_deref()).await,
        Commands::Proxy { config } => run_proxy(config.as_deref()).await,
    };

    if let Err(e) = result {
        // Tracing may not be initialized yet when the config is rejected.
        eprintln!("cmder: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(level: &str) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| level.to_string());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
}

fn warn_default_key(key: &str) {
    if key == "change-me" {
        warn!("Using default security key; set CMDER_SECURITY_KEY or update config");
    }
}

async fn run_agent(config_path: Option<&str>) -> Result<(), StartupError> {
    let config: AgentConfig = config::load(config_path)?;
    init_tracing(&config.logging.level);

    info!("cmder agent v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        capacity = config.tasks.capacity,
        units = config.unit_limit(),
        shell = %config.shell.shell,
        "task limits"
    );
    warn_default_key(&config.auth.security_key);

    let listen = config.server.listen.clone();
    let ctx = AgentContext::new(config);
    serve(&listen, cmder::agent_router(ctx.clone())).await?;

    if !ctx.registry.is_empty().await {
        warn!(
            tasks = ctx.registry.len().await,
            "Shutting down with tasks outstanding"
        );
    }
    Ok(())
}

async fn run_proxy(config_path: Option<&str>) -> Result<(), StartupError> {
    let config: ProxyConfig = config::load(config_path)?;
    init_tracing(&config.logging.level);

    info!("cmder proxy v{} starting", env!("CARGO_PKG_VERSION"));
    for target in &config.targets {
        info!(target_name = %target.name, address = %target.address, "target");
    }
    warn_default_key(&config.auth.security_key);

    let listen = config.server.listen.clone();
    let app = cmder::proxy_router(ProxyContext::new(config));
    serve(&listen, app).await
}

async fn serve(listen: &str, app: Router) -> Result<(), StartupError> {
    let listener = TcpListener::bind(listen)
        .await
        .map_err(|source| StartupError::Bind {
            addr: listen.to_string(),
            source,
        })?;
    info!("Listening on {listen}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(StartupError::Serve)?;

    info!("Goodbye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                error!("Failed to register SIGTERM handler: {e}");
                let _ = ctrl_c.await;
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("Received SIGINT");
    }
}
