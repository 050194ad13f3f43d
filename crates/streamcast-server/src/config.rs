//! Server configuration.
//!
//! Flags (with env fallbacks) layered over an optional TOML file;
//! flags win. A standalone server with no secret configured mints its
//! own id as the mesh secret; a server dialing into an existing mesh
//! must be given the mesh's secret explicitly.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

pub const DEFAULT_PORT: u16 = 3780;
pub const DEFAULT_MAX_PEERS: usize = 50;
pub const DEFAULT_MAX_CLIENTS: usize = 16;
pub const DEFAULT_GOSSIP_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone, Parser)]
#[command(name = "streamcast-server", about = "Federated activity-broadcast server")]
pub struct Cli {
    /// Optional TOML config file; flags override its values.
    #[arg(long, env = "STREAMCAST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port to listen on.
    #[arg(long, env = "STREAMCAST_PORT")]
    pub port: Option<u16>,

    /// Hostname advertised to peers and redirected clients.
    #[arg(long, env = "STREAMCAST_HOSTNAME")]
    pub hostname: Option<String>,

    /// Server id announced to the mesh.
    #[arg(long, env = "STREAMCAST_ID")]
    pub id: Option<String>,

    /// Shared mesh secret.
    #[arg(long, env = "STREAMCAST_SECRET")]
    pub secret: Option<String>,

    /// Remote peer to dial on startup.
    #[arg(long, env = "STREAMCAST_REMOTE_HOST")]
    pub remote_host: Option<String>,

    /// Port of the remote peer.
    #[arg(long, env = "STREAMCAST_REMOTE_PORT")]
    pub remote_port: Option<u16>,

    /// Client admission ceiling.
    #[arg(long)]
    pub max_clients: Option<usize>,

    /// Peer connection ceiling.
    #[arg(long)]
    pub max_peers: Option<usize>,

    /// Seconds between SERVER_ANNOUNCE broadcasts.
    #[arg(long)]
    pub gossip_interval_secs: Option<u64>,

    /// Seconds before an unanswered lock round counts as denied.
    #[arg(long)]
    pub lock_timeout_secs: Option<u64>,
}

/// The TOML file mirror of [`Cli`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub port: Option<u16>,
    pub hostname: Option<String>,
    pub id: Option<String>,
    pub secret: Option<String>,
    pub remote_host: Option<String>,
    pub remote_port: Option<u16>,
    pub max_clients: Option<usize>,
    pub max_peers: Option<usize>,
    pub gossip_interval_secs: Option<u64>,
    pub lock_timeout_secs: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("a server dialing a remote peer must be given the mesh secret")]
    MissingSecret,
    #[error("remote_port given without remote_host")]
    DanglingRemotePort,
}

/// Fully-resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub hostname: String,
    pub id: String,
    pub secret: String,
    /// Peer to dial on startup, if any.
    pub remote: Option<(String, u16)>,
    pub max_clients: usize,
    pub max_peers: usize,
    pub gossip_interval: Duration,
    pub lock_timeout: Duration,
}

impl ServerConfig {
    /// Resolve CLI flags, reading the TOML file if one was named.
    pub fn load(cli: Cli) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => toml::from_str(&std::fs::read_to_string(path)?)?,
            None => FileConfig::default(),
        };
        Self::resolve(cli, file)
    }

    /// Layer `cli` over `file` and fill in defaults.
    pub fn resolve(cli: Cli, file: FileConfig) -> Result<Self, ConfigError> {
        let port = cli.port.or(file.port).unwrap_or(DEFAULT_PORT);
        let hostname = cli
            .hostname
            .or(file.hostname)
            .unwrap_or_else(|| "localhost".to_owned());
        let id = cli
            .id
            .or(file.id)
            .unwrap_or_else(|| format!("{hostname}:{port}"));

        let remote_host = cli.remote_host.or(file.remote_host);
        let remote_port = cli.remote_port.or(file.remote_port);
        let remote = match (remote_host, remote_port) {
            (Some(host), port) => Some((host, port.unwrap_or(DEFAULT_PORT))),
            (None, Some(_)) => return Err(ConfigError::DanglingRemotePort),
            (None, None) => None,
        };

        // A standalone server seeds the mesh and may mint its own
        // secret; a joining server must present the mesh's.
        let secret = match (cli.secret.or(file.secret), &remote) {
            (Some(secret), _) => secret,
            (None, None) => id.clone(),
            (None, Some(_)) => return Err(ConfigError::MissingSecret),
        };

        Ok(ServerConfig {
            port,
            hostname,
            id,
            secret,
            remote,
            max_clients: cli.max_clients.or(file.max_clients).unwrap_or(DEFAULT_MAX_CLIENTS),
            max_peers: cli.max_peers.or(file.max_peers).unwrap_or(DEFAULT_MAX_PEERS),
            gossip_interval: Duration::from_secs(
                cli.gossip_interval_secs
                    .or(file.gossip_interval_secs)
                    .unwrap_or(DEFAULT_GOSSIP_INTERVAL_SECS),
            ),
            lock_timeout: Duration::from_secs(
                cli.lock_timeout_secs
                    .or(file.lock_timeout_secs)
                    .unwrap_or(DEFAULT_LOCK_TIMEOUT_SECS),
            ),
        })
    }

    /// The address peers should use to reach this server.
    pub fn advertised_address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}
