//! # lanchat-server
//!
//! Standalone LAN chat server. Clients connect on the chat port (60000 by
//! default); file transfers use one ephemeral port each. All settings come
//! from the environment, see [`ServerConfig`].

use tracing::info;
use tracing_subscriber::EnvFilter;

use lanchat_server::{ChatServer, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,lanchat_server=debug,lanchat_net=info")),
        )
        .init();

    info!("Starting LAN chat server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Bind and serve until Ctrl+C
    // -----------------------------------------------------------------------
    let server = ChatServer::bind(config).await?;
    server.run_until_ctrl_c().await?;

    info!("Shut down cleanly");
    Ok(())
}
