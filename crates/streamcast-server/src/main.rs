//! Streamcast server daemon.
//!
//! Run a standalone mesh seed:
//!   streamcast-server --port 3780 --id node-a
//!
//! Join an existing mesh:
//!   streamcast-server --port 3781 --id node-b \
//!     --remote-host localhost --remote-port 3780 --secret <mesh secret>

use clap::Parser;
use streamcast_server::config::{Cli, ServerConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("streamcast_server=info".parse()?),
        )
        .init();

    let config = ServerConfig::load(Cli::parse())?;
    tracing::info!(
        "starting {} on port {} (clients <= {}, peers <= {})",
        config.id,
        config.port,
        config.max_clients,
        config.max_peers
    );

    streamcast_server::run(config).await
}
