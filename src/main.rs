//! Catalyst Content Daemon
//!
//! Runs a content server node: pulls deployments from peers, keeps the
//! active-pointer view, rebuilds snapshots and collects garbage.
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults
//! catalyst-content
//!
//! # Start with custom config
//! catalyst-content --config /path/to/config.toml
//!
//! # Explicit peers and own address
//! catalyst-content --server-address http://node-a:6969 --peer http://node-b:6969 --peer http://node-c:6969
//!
//! # Read-only node that does not sync
//! catalyst-content --disable-synchronization
//! ```

use anyhow::Context;
use clap::Parser;
use catalyst_content::{CatalystNode, Config};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "catalyst-content")]
#[command(about = "Content server node: peer sync, snapshots and garbage collection")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "STORAGE_ROOT_FOLDER")]
    storage_dir: Option<PathBuf>,

    /// This node's own public address
    #[arg(long, env = "CONTENT_SERVER_ADDRESS")]
    server_address: Option<String>,

    /// Peer content server (repeatable)
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Do not pull from peers
    #[arg(long, env = "DISABLE_SYNCHRONIZATION")]
    disable_synchronization: bool,

    /// Comma-separated entity types to skip during sync
    #[arg(long, env = "SYNC_IGNORED_ENTITY_TYPES", value_delimiter = ',')]
    sync_ignored_entity_types: Vec<String>,

    /// Delete blobs no active entity references
    #[arg(long, env = "GARBAGE_COLLECTION")]
    garbage_collection: bool,

    /// Maximum concurrent deployment jobs
    #[arg(long, env = "JOB_QUEUE_CONCURRENCY")]
    job_queue_concurrency: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("catalyst_content=info".parse()?),
        )
        .init();

    let args = Args::parse();

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    if let Some(address) = args.server_address {
        config.server_address = address;
    }
    if !args.peers.is_empty() {
        config.peers = args.peers;
    }
    if args.disable_synchronization {
        config.disable_synchronization = true;
    }
    if !args.sync_ignored_entity_types.is_empty() {
        config.sync_ignored_entity_types = args.sync_ignored_entity_types;
    }
    if args.garbage_collection {
        config.garbage_collection = true;
    }
    if let Some(concurrency) = args.job_queue_concurrency {
        config.job_queue_concurrency = concurrency;
    }

    std::fs::create_dir_all(&config.storage_dir)
        .with_context(|| format!("Failed to create {}", config.storage_dir.display()))?;

    // Save default config if it doesn't exist
    let config_path = config.config_path();
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    info!(
        address = %config.server_address,
        blobs = %config.blobs_dir().display(),
        database = %config.database_path().display(),
        peers = config.peers.len(),
        "Starting content node"
    );

    let node = CatalystNode::open(config).await.context("Failed to open content node")?;
    node.start().await?;

    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down...");
    node.shutdown().await;

    if let Ok(stats) = node.stats() {
        info!(
            deployments = stats.deployments,
            active = stats.active_deployments,
            snapshots = stats.snapshots,
            failed = stats.failed_deployments,
            "Final stats"
        );
    }

    Ok(())
}
