//! Clustervote node binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use clustervote_common::ClusterConfig;
use clustervote_core::{Controller, Redialer, TimerConfig};
use clustervote_net::{ConnectionManager, TlsMaterial};

/// Runs one member of a statically-configured leader-election cluster.
#[derive(Parser, Debug)]
#[command(name = "clustervote-node", version)]
struct Cli {
    /// This node's 0-based index into the membership certificate bundle.
    #[arg(long)]
    id: usize,

    /// Path to this node's private key (PEM).
    #[arg(long, default_value = "key.pem")]
    key: PathBuf,

    /// Path to the membership certificate bundle (concatenated PEM certs).
    #[arg(long, default_value = "certs.pem")]
    certs: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config = ClusterConfig::load(&cli.certs, cli.id)?;
    info!(
        id = config.self_identity().id(),
        members = config.member_count(),
        "loaded membership"
    );

    let listen_addr = clustervote_net::common_name(config.self_identity().certificate())?;
    let tls = TlsMaterial::new(config.self_identity().certificate().to_vec(), &cli.key, config.peers().to_vec())?;

    let (connection_tx, connection_rx) = mpsc::channel(100);
    let (inbound_tx, inbound_rx) = mpsc::channel(100);
    let (disconnect_tx, disconnect_rx) = mpsc::channel(100);

    let connection_manager = ConnectionManager::start(
        config.self_identity(),
        config.peers(),
        tls,
        listen_addr,
        connection_tx,
        inbound_tx,
        disconnect_tx,
    )?;

    let mut controller = Controller::new(
        config.self_identity().id().to_string(),
        config.member_count(),
        TimerConfig::default(),
        connection_rx,
        inbound_rx,
        disconnect_rx,
        connection_manager as Arc<dyn Redialer>,
    );

    info!("starting controller");
    controller.run().await;

    Ok(())
}
