mod config;

use replkv_raft::{InMemoryTransport, KvNode, NodeId, NodeOptions};
use std::collections::HashMap;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "replkv.yaml".to_string());

    tracing::info!("Loading configuration from: {}", config_path);

    let config = if std::path::Path::new(&config_path).exists() {
        config::ServerConfig::load_from_file(&config_path)?
    } else {
        tracing::warn!("Config file not found, loading from environment variables");
        config::ServerConfig::load_from_env()?
    };

    tracing::info!("Starting replkv node: {}", config.node_id);
    tracing::info!("Data directory: {}", config.data_dir.display());

    let node_id = NodeId::new(config.node_id.clone());
    // In-process transport only: remote peers are not reachable from here.
    let (_rpc_tx, rpc_rx) = tokio::sync::mpsc::channel(256);
    let transport = Arc::new(InMemoryTransport::new(node_id.clone(), HashMap::new()));
    let options =
        NodeOptions::new(node_id, config.raft_dir()).with_raft_config(config.to_raft_config());
    let node = KvNode::open(options, transport, rpc_rx).await?;

    if !config.voters.is_empty() {
        let voters = config.voters.iter().cloned().map(NodeId::new);
        if node.bootstrap_with(voters).await? {
            tracing::info!(voters = ?config.voters, "Bootstrapped cluster");
        }
    } else if config.bootstrap && node.bootstrap().await? {
        tracing::info!("Bootstrapped single-voter cluster");
    }

    node.start()?;
    tracing::info!("replkv server is ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, gracefully shutting down...");

    node.shutdown().await;
    let status = node.status();
    tracing::info!(
        term = %status.term,
        commit_index = %status.commit_index,
        last_applied = %status.last_applied,
        "Shutdown complete"
    );
    Ok(())
}
