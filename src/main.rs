use anyhow::Context;
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use peerstore::{Config, Node};

#[derive(Parser, Debug)]
#[command(name = "peerstore", version, about = "Peer-replicated object storage node")]
struct Cli {
    /// Node identifier; a random one is generated when omitted
    #[arg(long)]
    node_id: Option<String>,

    /// IP address to bind the HTTP API to
    #[arg(long, default_value = "0.0.0.0")]
    ip: IpAddr,

    /// Port to listen on
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Address peers use to reach this node (host:port)
    #[arg(long)]
    advertise: Option<String>,

    /// Storage directory
    #[arg(long, default_value = "./data")]
    storage: PathBuf,

    /// Capacity offered to the cluster, in bytes
    #[arg(long, default_value_t = 10 * 1024 * 1024 * 1024)]
    capacity: u64,

    /// Comma-separated seed peer addresses (host:port)
    #[arg(long, value_delimiter = ',')]
    peers: Vec<String>,

    /// Peer copies requested per object
    #[arg(long, default_value_t = 3)]
    replication_factor: usize,

    #[arg(long, default_value_t = 30)]
    sweep_interval_secs: u64,

    #[arg(long, default_value_t = 60)]
    stale_after_secs: u64,

    #[arg(long, default_value_t = 5)]
    probe_timeout_secs: u64,

    #[arg(long, default_value_t = 600)]
    expire_after_secs: u64,

    #[arg(long, default_value_t = 30)]
    push_timeout_secs: u64,

    /// Replications allowed to run at the same time
    #[arg(long, default_value_t = 16)]
    max_in_flight: usize,

    /// Push attempts per target, including the first
    #[arg(long, default_value_t = 1)]
    max_attempts: u32,
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        let node_id = cli
            .node_id
            .unwrap_or_else(|| format!("node-{}", uuid::Uuid::new_v4().simple()));

        let mut config = Config::new(node_id, cli.ip, cli.port);
        config.advertise_address = cli.advertise;
        config.storage_path = cli.storage;
        config.capacity = cli.capacity;
        config.peers = cli
            .peers
            .into_iter()
            .map(|peer| peer.trim().to_string())
            .filter(|peer| !peer.is_empty())
            .collect();
        config.replication_factor = cli.replication_factor;
        config.sweep_interval_secs = cli.sweep_interval_secs;
        config.stale_after_secs = cli.stale_after_secs;
        config.probe_timeout_secs = cli.probe_timeout_secs;
        config.expire_after_secs = cli.expire_after_secs;
        config.push_timeout_secs = cli.push_timeout_secs;
        config.max_in_flight = cli.max_in_flight;
        config.max_attempts = cli.max_attempts;
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from(Cli::parse());
    info!("Node configuration: {:?}", config);

    let node = Node::new(config)
        .await
        .context("failed to initialise node")?;

    node.start(shutdown_signal())
        .await
        .context("node stopped with an error")?;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
