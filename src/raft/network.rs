//! HTTP transport between raft peers.
//!
//! Each RPC is a JSON POST against the target's raft listener; the remote
//! handler replies with the serialized `Result` of its local raft call, so
//! remote raft errors round-trip intact while transport failures map to
//! [`NetworkError`].

use openraft::error::{InstallSnapshotError, NetworkError, RPCError, RaftError, RemoteError};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::BasicNode;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::raft::types::{NodeId, TypeConfig};

/// Builds one [`HttpRaftConnection`] per peer, sharing a reqwest client.
#[derive(Clone, Default)]
pub struct HttpRaftNetwork {
    client: reqwest::Client,
}

impl HttpRaftNetwork {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RaftNetworkFactory<TypeConfig> for HttpRaftNetwork {
    type Network = HttpRaftConnection;

    async fn new_client(&mut self, target: NodeId, node: &BasicNode) -> Self::Network {
        HttpRaftConnection {
            client: self.client.clone(),
            target,
            addr: node.addr.clone(),
        }
    }
}

/// Connection to a single peer's raft listener.
pub struct HttpRaftConnection {
    client: reqwest::Client,
    target: NodeId,
    addr: String,
}

impl HttpRaftConnection {
    async fn send<Req, Resp, Err>(
        &self,
        rpc: &str,
        req: &Req,
    ) -> Result<Resp, RPCError<NodeId, BasicNode, Err>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        Err: std::error::Error + DeserializeOwned,
    {
        let url = format!("http://{}/raft/{}", self.addr, rpc);
        let response = self
            .client
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(|err| RPCError::Network(NetworkError::new(&err)))?;
        let result: Result<Resp, Err> = response
            .json()
            .await
            .map_err(|err| RPCError::Network(NetworkError::new(&err)))?;
        result.map_err(|err| RPCError::RemoteError(RemoteError::new(self.target, err)))
    }
}

impl RaftNetwork<TypeConfig> for HttpRaftConnection {
    async fn append_entries(
        &mut self,
        req: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>>
    {
        self.send("append", &req).await
    }

    async fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        self.send("snapshot", &req).await
    }

    async fn vote(
        &mut self,
        req: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        self.send("vote", &req).await
    }
}
