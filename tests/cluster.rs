//! In-process cluster tests.
//!
//! Three raft nodes wired through an in-memory router exchange lock commands;
//! the tests assert that every replica's lock map converges to the same state
//! and that log order, not arrival order, decides contended acquires.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use openraft::error::{NetworkError, RPCError, RaftError, RemoteError};
use openraft::metrics::WaitError;
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, ClientWriteResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, VoteRequest, VoteResponse,
};
use openraft::{BasicNode, Config, Raft};
use tokio::sync::RwLock;

use warden::raft::storage::StateMachineStore;
use warden::raft::types::{LockCommand, NodeId, TypeConfig};
use warden::store::{LockError, LockStore};

const RPC_LATENCY: Duration = Duration::from_millis(2);
const TEST_LEASE: Duration = Duration::from_secs(30);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lock_commands_replicate_to_all_nodes() {
    let cluster = TestCluster::bootstrap(&[1, 2, 3]).await;
    let leader = cluster.wait_for_leader("initial leader").await;

    let index = cluster
        .write(
            leader,
            LockCommand::Acquire {
                key: "file1".into(),
                value: "owner1".into(),
            },
        )
        .await
        .expect("acquire should be admitted");
    cluster.wait_for_applied(index, "acquire replication").await;
    cluster.assert_owner("file1", Some("owner1")).await;

    let index = cluster
        .write(
            leader,
            LockCommand::Release {
                key: "file1".into(),
                value: "owner1".into(),
            },
        )
        .await
        .expect("release should be admitted");
    cluster.wait_for_applied(index, "release replication").await;
    cluster.assert_owner("file1", None).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn log_order_decides_contended_acquires() {
    let cluster = TestCluster::bootstrap(&[1, 2, 3]).await;
    let leader = cluster.wait_for_leader("initial leader").await;

    let first = cluster
        .write_response(
            leader,
            LockCommand::Acquire {
                key: "obj".into(),
                value: "owner1".into(),
            },
        )
        .await;
    assert_eq!(first.data.error, None);

    // The second command commits fine, but every replica rejects it on
    // apply because the first one precedes it in the log.
    let second = cluster
        .write_response(
            leader,
            LockCommand::Acquire {
                key: "obj".into(),
                value: "owner2".into(),
            },
        )
        .await;
    assert_eq!(second.data.error, Some(LockError::Held));

    cluster.wait_for_applied(second.log_id.index, "contended replication").await;
    cluster.assert_owner("obj", Some("owner1")).await;

    // An unauthorized release is rejected identically everywhere.
    let bad_release = cluster
        .write_response(
            leader,
            LockCommand::Release {
                key: "obj".into(),
                value: "owner2".into(),
            },
        )
        .await;
    assert_eq!(bad_release.data.error, Some(LockError::Unauthorized));
    cluster.assert_owner("obj", Some("owner1")).await;
}

struct TestNode {
    raft: Raft<TypeConfig>,
    store: Arc<LockStore>,
}

struct TestCluster {
    nodes: BTreeMap<NodeId, TestNode>,
    members: Vec<NodeId>,
}

impl TestCluster {
    async fn bootstrap(ids: &[NodeId]) -> Self {
        let router = TestRouter::new();
        let config = Arc::new(build_config());
        let mut nodes = BTreeMap::new();

        for &id in ids {
            let store = Arc::new(LockStore::new(TEST_LEASE));
            let log_store = warden::raft::storage::MemLogStore::default();
            let state_machine = StateMachineStore::new(store.clone());
            let network = TestNetworkFactory::new(id, router.clone());
            let raft = Raft::new(id, config.clone(), network, log_store, state_machine)
                .await
                .expect("raft node");
            router.register(id, raft.clone()).await;
            nodes.insert(id, TestNode { raft, store });
        }

        let cluster = Self {
            nodes,
            members: ids.to_vec(),
        };
        cluster.initialize().await;
        cluster
    }

    async fn initialize(&self) {
        let first = self.members[0];
        let membership = self.members.iter().fold(BTreeMap::new(), |mut acc, id| {
            acc.insert(*id, BasicNode::new(format!("node-{id}")));
            acc
        });
        self.nodes
            .get(&first)
            .expect("initializer")
            .raft
            .initialize(membership)
            .await
            .expect("cluster init");
    }

    async fn wait_for_leader(&self, label: &str) -> NodeId {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            for (&id, node) in &self.nodes {
                match node
                    .raft
                    .wait(Some(Duration::from_millis(500)))
                    .metrics(|m| m.current_leader.is_some(), format!("{label} via node {id}"))
                    .await
                {
                    Ok(metrics) => return metrics.current_leader.expect("leader id"),
                    Err(WaitError::Timeout(_, _)) => {
                        assert!(
                            Instant::now() < deadline,
                            "timed out waiting for leader via node {id}"
                        );
                    }
                    Err(err) => panic!("wait error for node {id}: {err:?}"),
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    async fn write_response(
        &self,
        leader: NodeId,
        command: LockCommand,
    ) -> ClientWriteResponse<TypeConfig> {
        self.nodes
            .get(&leader)
            .expect("leader")
            .raft
            .client_write(command)
            .await
            .expect("client write succeeds")
    }

    async fn write(&self, leader: NodeId, command: LockCommand) -> Result<u64, LockError> {
        let response = self.write_response(leader, command).await;
        match response.data.error {
            Some(err) => Err(err),
            None => Ok(response.log_id.index),
        }
    }

    async fn wait_for_applied(&self, index: u64, label: &str) {
        for (&id, node) in &self.nodes {
            node.raft
                .wait(Some(Duration::from_secs(3)))
                .metrics(
                    move |m| m.last_applied.map(|log_id| log_id.index).unwrap_or(0) >= index,
                    format!("{label} on node {id}"),
                )
                .await
                .unwrap_or_else(|err| panic!("node {id} failed to apply {index}: {err:?}"));
        }
    }

    async fn assert_owner(&self, object: &str, expected: Option<&str>) {
        for (&id, node) in &self.nodes {
            assert_eq!(
                node.store.lookup(object).as_deref(),
                expected,
                "owner mismatch on node {id} for {object}"
            );
        }
    }
}

fn build_config() -> Config {
    let config = Config {
        cluster_name: "warden-tests".to_string(),
        election_timeout_min: 40,
        election_timeout_max: 80,
        heartbeat_interval: 20,
        ..Default::default()
    };
    config.validate().expect("config validate")
}

#[derive(Clone, Default)]
struct TestRouter {
    inner: Arc<TestRouterInner>,
}

#[derive(Default)]
struct TestRouterInner {
    peers: RwLock<HashMap<NodeId, Raft<TypeConfig>>>,
    partitions: RwLock<HashSet<(NodeId, NodeId)>>,
}

impl TestRouter {
    fn new() -> Self {
        Self::default()
    }

    async fn register(&self, node: NodeId, raft: Raft<TypeConfig>) {
        self.inner.peers.write().await.insert(node, raft);
    }

    async fn connected(&self, a: NodeId, b: NodeId) -> bool {
        !self.inner.partitions.read().await.contains(&(a, b))
    }

    async fn with_target<F, Fut, T, E>(
        &self,
        from: NodeId,
        to: NodeId,
        f: F,
    ) -> Result<T, RPCError<NodeId, BasicNode, RaftError<NodeId, E>>>
    where
        F: FnOnce(Raft<TypeConfig>) -> Fut,
        Fut: Future<Output = Result<T, RaftError<NodeId, E>>>,
        E: Send + Sync + std::fmt::Debug + std::error::Error + 'static,
    {
        if !self.connected(from, to).await {
            return Err(RPCError::Network(partition_error()));
        }
        let target = self
            .inner
            .peers
            .read()
            .await
            .get(&to)
            .cloned()
            .ok_or_else(|| RPCError::Network(partition_error()))?;
        tokio::time::sleep(RPC_LATENCY).await;
        match f(target).await {
            Ok(response) => Ok(response),
            Err(err) => Err(RPCError::RemoteError(RemoteError::new(to, err))),
        }
    }
}

#[derive(Clone)]
struct TestNetworkFactory {
    node: NodeId,
    router: TestRouter,
}

impl TestNetworkFactory {
    fn new(node: NodeId, router: TestRouter) -> Self {
        Self { node, router }
    }
}

impl RaftNetworkFactory<TypeConfig> for TestNetworkFactory {
    type Network = TestNetwork;

    async fn new_client(&mut self, target: NodeId, _node: &BasicNode) -> Self::Network {
        TestNetwork {
            from: self.node,
            target,
            router: self.router.clone(),
        }
    }
}

struct TestNetwork {
    from: NodeId,
    target: NodeId,
    router: TestRouter,
}

impl RaftNetwork<TypeConfig> for TestNetwork {
    async fn append_entries(
        &mut self,
        req: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        self.router
            .with_target(self.from, self.target, move |raft| async move {
                raft.append_entries(req).await
            })
            .await
    }

    async fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<
            NodeId,
            BasicNode,
            RaftError<NodeId, openraft::error::InstallSnapshotError>,
        >,
    > {
        self.router
            .with_target(self.from, self.target, move |raft| async move {
                raft.install_snapshot(req).await
            })
            .await
    }

    async fn vote(
        &mut self,
        req: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        self.router
            .with_target(self.from, self.target, move |raft| async move {
                raft.vote(req).await
            })
            .await
    }
}

fn partition_error() -> NetworkError {
    let err = io::Error::other("link down");
    NetworkError::new(&err)
}
