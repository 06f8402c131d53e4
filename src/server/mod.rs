//! Server-side node: wires the lock store, the raft instance, and the two
//! listeners together.
//!
//! A node owns two addresses: the raft address from its configuration, where
//! peers exchange consensus RPCs, and the application address (the same host
//! with the port incremented by one) where clients and proxying peers speak
//! the JSON lock protocol. Keeping the two one port apart lets any node
//! derive a peer's application address from cluster metadata alone.

pub mod router;

use std::collections::BTreeMap;
use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use openraft::{BasicNode, Raft};
use snafu::{ResultExt, Snafu};
use tokio::task::JoinHandle;
use tracing::info;

use crate::constants::DEFAULT_LEASE;
use crate::raft::network::HttpRaftNetwork;
use crate::raft::raft_config;
use crate::raft::server::raft_router;
use crate::raft::storage::{LogStoreError, mem_storage, redb_storage};
use crate::raft::types::{NodeId, TypeConfig};
use crate::server::router::{AppState, app_router};
use crate::store::LockStore;

/// Startup configuration for one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: NodeId,
    /// host:port the raft RPC listener binds to; peers dial this address.
    pub raft_addr: String,
    /// Directory for the persistent raft log. Unused in in-memory mode.
    pub data_dir: PathBuf,
    /// Keep the raft log in memory instead of on disk.
    pub in_memory: bool,
    /// How long an acquired lock stays authoritative.
    pub lease: Duration,
    /// Initialize a fresh single-node cluster with this node as leader.
    pub bootstrap: bool,
    /// Application address of an existing cluster member to join through.
    pub join: Option<String>,
}

impl NodeConfig {
    pub fn new(node_id: NodeId, raft_addr: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_id,
            raft_addr: raft_addr.into(),
            data_dir: data_dir.into(),
            in_memory: false,
            lease: DEFAULT_LEASE,
            bootstrap: false,
            join: None,
        }
    }
}

/// Node startup and cluster membership failures.
#[derive(Debug, Snafu)]
pub enum NodeError {
    #[snafu(display("invalid raft address {addr:?}: {reason}"))]
    InvalidAddr { addr: String, reason: String },

    #[snafu(display("failed to open log storage: {source}"))]
    Storage { source: LogStoreError },

    #[snafu(display("raft config rejected: {source}"))]
    Config { source: openraft::ConfigError },

    #[snafu(display("failed to create raft instance: {source}"))]
    RaftInit { source: openraft::error::Fatal<NodeId> },

    #[snafu(display("failed to bind {addr}: {source}"))]
    Bind { addr: String, source: std::io::Error },

    #[snafu(display("cluster bootstrap failed: {message}"))]
    Bootstrap { message: String },

    #[snafu(display("join request to {addr} failed: {source}"))]
    JoinTransport { addr: String, source: reqwest::Error },

    #[snafu(display("join request to {addr} rejected: {body}"))]
    JoinRejected { addr: String, body: String },

    #[snafu(display("listener terminated: {source}"))]
    Listener { source: std::io::Error },
}

/// Derive the application (HTTP) address from a raft address: same host,
/// port incremented by one.
pub fn http_addr_from_raft(raft_addr: &str) -> Result<String, NodeError> {
    let (host, port) = raft_addr.rsplit_once(':').ok_or_else(|| NodeError::InvalidAddr {
        addr: raft_addr.to_owned(),
        reason: "expected host:port".to_owned(),
    })?;
    let port: u16 = port.parse().map_err(|_| NodeError::InvalidAddr {
        addr: raft_addr.to_owned(),
        reason: "port is not numeric".to_owned(),
    })?;
    let http_port = port.checked_add(1).ok_or_else(|| NodeError::InvalidAddr {
        addr: raft_addr.to_owned(),
        reason: "port 65535 leaves no room for the application listener".to_owned(),
    })?;
    Ok(format!("{host}:{http_port}"))
}

/// A running node and its listener tasks.
pub struct Node {
    node_id: NodeId,
    raft: Raft<TypeConfig>,
    store: Arc<LockStore>,
    raft_addr: String,
    http_addr: String,
    listeners: Vec<JoinHandle<std::io::Result<()>>>,
}

impl Node {
    /// Boot a node from config: storage, raft, both listeners, then any
    /// bootstrap or join step.
    pub async fn start(config: NodeConfig) -> Result<Self, NodeError> {
        let http_addr = http_addr_from_raft(&config.raft_addr)?;
        let store = Arc::new(LockStore::new(config.lease));
        let raft_cfg = raft_config().context(ConfigSnafu)?;
        let network = HttpRaftNetwork::new();

        let raft = if config.in_memory {
            let (log, sm) = mem_storage(store.clone());
            Raft::new(config.node_id, raft_cfg, network, log, sm)
                .await
                .context(RaftInitSnafu)?
        } else {
            let (log, sm) = redb_storage(&config.data_dir, store.clone()).context(StorageSnafu)?;
            Raft::new(config.node_id, raft_cfg, network, log, sm)
                .await
                .context(RaftInitSnafu)?
        };

        let raft_listener = tokio::net::TcpListener::bind(&config.raft_addr)
            .await
            .context(BindSnafu { addr: config.raft_addr.clone() })?;
        let http_listener = tokio::net::TcpListener::bind(&http_addr)
            .await
            .context(BindSnafu { addr: http_addr.clone() })?;

        let state = AppState {
            node_id: config.node_id,
            raft: raft.clone(),
            store: store.clone(),
            http: reqwest::Client::new(),
        };

        // A fatal raft-core error (e.g. an undecodable committed entry) must
        // take the node down, not leave it serving stale state.
        let raft_supervisor = {
            let mut metrics = raft.metrics();
            tokio::spawn(async move {
                loop {
                    let fatal = metrics
                        .borrow()
                        .running_state
                        .as_ref()
                        .err()
                        .map(|err| err.to_string());
                    if let Some(message) = fatal {
                        return Err(std::io::Error::other(format!("raft core failed: {message}")));
                    }
                    if metrics.changed().await.is_err() {
                        return Ok(());
                    }
                }
            })
        };

        let listeners = vec![
            tokio::spawn(axum::serve(raft_listener, raft_router(raft.clone())).into_future()),
            tokio::spawn(axum::serve(http_listener, app_router(state)).into_future()),
            raft_supervisor,
        ];

        info!(
            node_id = config.node_id,
            raft_addr = %config.raft_addr,
            http_addr = %http_addr,
            in_memory = config.in_memory,
            "node listening"
        );

        let node = Self {
            node_id: config.node_id,
            raft,
            store,
            raft_addr: config.raft_addr.clone(),
            http_addr,
            listeners,
        };

        if config.bootstrap {
            node.bootstrap().await?;
        }
        if let Some(peer) = &config.join {
            node.join(peer).await?;
        }

        Ok(node)
    }

    /// Initialize a fresh single-node cluster. No-op if the raft state was
    /// already initialized (e.g. a restart on persisted storage).
    pub async fn bootstrap(&self) -> Result<(), NodeError> {
        let initialized = self.raft.is_initialized().await.map_err(|err| NodeError::Bootstrap {
            message: err.to_string(),
        })?;
        if initialized {
            info!(node_id = self.node_id, "cluster already initialized, skipping bootstrap");
            return Ok(());
        }
        let mut members = BTreeMap::new();
        members.insert(self.node_id, BasicNode::new(self.raft_addr.clone()));
        self.raft.initialize(members).await.map_err(|err| NodeError::Bootstrap {
            message: err.to_string(),
        })?;
        info!(node_id = self.node_id, "bootstrapped single-node cluster");
        Ok(())
    }

    /// Ask an existing member (by application address) to add this node as a
    /// voter. The request is routed to the leader by the member's proxy.
    pub async fn join(&self, peer_http_addr: &str) -> Result<(), NodeError> {
        let body = serde_json::json!({
            "addr": self.raft_addr,
            "id": self.node_id.to_string(),
        });
        let url = format!("http://{peer_http_addr}/join");
        let response = reqwest::Client::new()
            .post(&url)
            .json(&body)
            .send()
            .await
            .context(JoinTransportSnafu { addr: peer_http_addr.to_owned() })?;
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return JoinRejectedSnafu {
                addr: peer_http_addr.to_owned(),
                body: text,
            }
            .fail();
        }
        info!(node_id = self.node_id, peer = peer_http_addr, "joined cluster");
        Ok(())
    }

    pub fn raft(&self) -> Raft<TypeConfig> {
        self.raft.clone()
    }

    pub fn store(&self) -> Arc<LockStore> {
        self.store.clone()
    }

    pub fn raft_addr(&self) -> &str {
        &self.raft_addr
    }

    pub fn http_addr(&self) -> &str {
        &self.http_addr
    }

    /// Block until a listener task terminates. A clean process never gets
    /// here, so the result is always a startup-surface failure.
    pub async fn wait(&mut self) -> Result<(), NodeError> {
        if self.listeners.is_empty() {
            return Ok(());
        }
        let (result, _, rest) = futures::future::select_all(self.listeners.drain(..)).await;
        self.listeners = rest;
        match result {
            Ok(io_result) => io_result.context(ListenerSnafu),
            Err(join_err) => Err(NodeError::Listener {
                source: std::io::Error::other(join_err),
            }),
        }
    }

    /// Stop raft and both listeners.
    pub async fn shutdown(self) {
        if let Err(err) = self.raft.shutdown().await {
            tracing::warn!(error = %err, "raft shutdown reported an error");
        }
        for listener in self.listeners {
            listener.abort();
        }
    }
}
