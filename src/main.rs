//! TGC Session Server
//!
//! Reads configuration from the environment and serves until an admin
//! shutdown or Ctrl-C.

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use tgc_server::{GameServer, ServerConfig, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    info!("TGC Session Server v{}", VERSION);

    let config = ServerConfig::from_env().context("Invalid server configuration")?;
    info!("Base Port: {}", config.base_port);
    info!("Max Players: {}", config.max_players);
    match &config.allowed_version {
        Some(version) => info!("Allowed Client Version: {}", version),
        None => warn!("No allowed client version set; accepting any client"),
    }
    if config.admin_key.is_none() {
        warn!("No remote admin key set; admin commands are disabled");
    }

    let server = GameServer::new(config);

    let state = server.state();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            state.request_shutdown();
        }
    });

    server.run().await.context("Server failed")?;
    Ok(())
}
