//! warden-node binary: cluster node entry point.
//!
//! Runs one lock-service node: the raft RPC listener on `--raft-addr` and
//! the application listener one port above it. The first node of a cluster
//! starts with `--bootstrap`; further nodes point `--join` at any existing
//! member's application address.
//!
//! ```bash
//! warden-node --node-id 1 --raft-addr 127.0.0.1:7000 --bootstrap
//! warden-node --node-id 2 --raft-addr 127.0.0.1:7100 --join 127.0.0.1:7001
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use warden::server::{Node, NodeConfig};

#[derive(Debug, Parser)]
#[command(name = "warden-node", about = "Replicated advisory lock service node")]
struct Args {
    /// Unique numeric id of this node within the cluster.
    #[arg(long)]
    node_id: u64,

    /// host:port the raft listener binds; the application listener uses
    /// the next port up.
    #[arg(long, default_value = "127.0.0.1:7000")]
    raft_addr: String,

    /// Directory for the persistent raft log.
    #[arg(long, default_value = "./warden-data")]
    data_dir: PathBuf,

    /// Keep consensus state in memory instead of on disk.
    #[arg(long)]
    in_memory: bool,

    /// Lock lease duration in milliseconds.
    #[arg(long, default_value_t = 5000)]
    lease_ms: u64,

    /// Initialize a fresh single-node cluster with this node as leader.
    #[arg(long)]
    bootstrap: bool,

    /// Application address (host:port) of an existing member to join through.
    #[arg(long)]
    join: Option<String>,
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = NodeConfig {
        node_id: args.node_id,
        raft_addr: args.raft_addr,
        data_dir: args.data_dir,
        in_memory: args.in_memory,
        lease: Duration::from_millis(args.lease_ms),
        bootstrap: args.bootstrap,
        join: args.join,
    };

    let mut node = Node::start(config).await.context("node startup failed")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
        result = node.wait() => {
            result.context("listener failed")?;
        }
    }

    node.shutdown().await;
    Ok(())
}
