//! Burrow control-plane server
//!
//! Serves the HTTP API and agent WebSocket sessions, and runs the offline sweep.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use burrow_api::{ApiServer, ApiServerConfig};
use burrow_control::{ControlConfig, ControlPlane, LocalMessageBus, MAX_DURATION};

/// Burrow - control plane for a fleet of tunnel sites, clients and exit nodes
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(about = "Burrow - control plane for a fleet of tunnel sites, clients and exit nodes")]
#[command(version)]
struct ServerArgs {
    /// Address for the HTTP API and agent WebSocket
    #[arg(long, env = "BURROW_API_ADDR", default_value = "0.0.0.0:3001")]
    api_addr: SocketAddr,

    /// Database URL (postgres://..., sqlite://path?mode=rwc, sqlite::memory:)
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite::memory:")]
    database_url: String,

    /// Log level used when RUST_LOG is not set
    #[arg(long, env = "BURROW_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Seconds between offline sweeps
    #[arg(long, env = "BURROW_SWEEP_INTERVAL_SECS", default_value = "30")]
    sweep_interval_secs: u64,

    /// Prefix length of the subnet carved out for each site
    #[arg(long, env = "BURROW_SITE_BLOCK_SIZE", default_value = "30")]
    site_block_size: u8,

    /// Lifetime of an agent session token, renewed while in use
    #[arg(long, env = "BURROW_SESSION_TTL_DAYS", default_value = "30")]
    session_ttl_days: u64,

    /// Timeout for HTTP calls to local exit nodes
    #[arg(long, env = "BURROW_EXIT_NODE_TIMEOUT_SECS", default_value = "8")]
    exit_node_timeout_secs: u64,

    /// Do not run the background offline sweep
    #[arg(long)]
    no_sweep: bool,

    /// Enable permissive CORS on the API
    #[arg(long)]
    enable_cors: bool,
}

impl ServerArgs {
    fn control_config(&self) -> Result<ControlConfig> {
        if !(1..=32).contains(&self.site_block_size) {
            anyhow::bail!(
                "site block size must be between 1 and 32, got {}",
                self.site_block_size
            );
        }

        let session_ttl = self
            .session_ttl_days
            .checked_mul(24 * 60 * 60)
            .map(Duration::from_secs)
            .filter(|ttl| *ttl <= MAX_DURATION)
            .with_context(|| format!("session TTL of {} days is too large", self.session_ttl_days))?;

        Ok(ControlConfig {
            site_block_size: self.site_block_size,
            session_ttl,
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
            exit_node_request_timeout: Duration::from_secs(self.exit_node_timeout_secs),
            ..ControlConfig::default()
        })
    }
}

/// Setup logging, preferring RUST_LOG over the configured level
fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = ServerArgs::parse();
    init_logging(&args.log_level);

    info!("Burrow starting...");
    let config = args.control_config()?;

    let db = burrow_db::connect(&args.database_url)
        .await
        .context("Failed to connect to database")?;
    burrow_db::migrate(&db)
        .await
        .context("Failed to run database migrations")?;
    if args.database_url.contains("memory") {
        warn!("Using an in-memory database; all state is lost on exit");
    }

    let bus = Arc::new(LocalMessageBus::new());
    let control = Arc::new(
        ControlPlane::new(db, config, bus.clone()).context("Failed to build control plane")?,
    );

    if args.no_sweep {
        info!("Offline sweep disabled");
    } else {
        control.sweeper.start().await;
        info!(
            interval_secs = args.sweep_interval_secs,
            "Offline sweep started"
        );
    }

    let server = ApiServer::new(
        ApiServerConfig {
            bind_addr: args.api_addr,
            enable_cors: args.enable_cors,
            cors_origins: None,
        },
        control.clone(),
        bus,
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down...");
    };

    let result = server.start(shutdown).await;

    control.sweeper.stop().await;
    info!("Burrow stopped");

    result
}
