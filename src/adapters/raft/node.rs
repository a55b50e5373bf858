//! [`RaftNode`] backed by `openraft`.
//!
//! The node is built before the engine is seeded and started afterwards; until
//! [`HttpRaftNode::start`] runs, every consensus call fails with [`RaftError::NotStarted`].
//! Entries reach the state machine only once a quorum of voters holds them.
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use openraft::{
    ChangeMembers, Raft, RaftMetrics, ServerState, SnapshotPolicy,
    error::{
        CheckIsLeaderError, ClientWriteError, Fatal, ForwardToLeader, InitializeError,
        InstallSnapshotError, RaftError as OpenRaftError,
    },
    raft::{
        AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
        InstallSnapshotResponse, VoteRequest, VoteResponse,
    },
};

use super::{
    ChangeRequest, MemberNode, NodeId, TypeConfig, log_store::RaftLogStore, network::RaftAdminClient,
    node_id, state_machine::FsmStore,
};
use crate::ports::{
    raft::{RaftError, RaftNode, RaftResult, RaftServer, RaftState, StateMachine, Suffrage},
    storage::Storage,
};

const HEARTBEAT_INTERVAL_MS: u64 = 250;
const ELECTION_TIMEOUT_MIN_MS: u64 = 1000;
const ELECTION_TIMEOUT_MAX_MS: u64 = 2000;
const REPLAY_TIMEOUT: Duration = Duration::from_secs(30);
const BOOTSTRAP_ELECTION_TIMEOUT: Duration = Duration::from_secs(6);

pub struct HttpRaftNode {
    name: String,
    id: NodeId,
    address: String,
    config: Arc<openraft::Config>,
    log: RaftLogStore,
    fsm: FsmStore,
    client: RaftAdminClient,
    raft: OnceCell<Raft<TypeConfig>>,
}

fn fatal(e: Fatal<NodeId>) -> RaftError {
    match e {
        Fatal::Stopped => RaftError::Shutdown,
        e => RaftError::Consensus(e.to_string()),
    }
}

fn forward(e: ForwardToLeader<NodeId, MemberNode>) -> RaftError {
    match e.leader_node {
        Some(node) => RaftError::NotLeader {
            leader: Some(node.addr),
        },
        None => RaftError::NoLeader,
    }
}

fn write_err(e: OpenRaftError<NodeId, ClientWriteError<NodeId, MemberNode>>) -> RaftError {
    match e {
        OpenRaftError::APIError(ClientWriteError::ForwardToLeader(f)) => forward(f),
        OpenRaftError::APIError(e) => RaftError::Consensus(e.to_string()),
        OpenRaftError::Fatal(e) => fatal(e),
    }
}

fn leader_check_err(e: OpenRaftError<NodeId, CheckIsLeaderError<NodeId, MemberNode>>) -> RaftError {
    match e {
        OpenRaftError::APIError(CheckIsLeaderError::ForwardToLeader(f)) => forward(f),
        OpenRaftError::APIError(CheckIsLeaderError::QuorumNotEnough(_)) => RaftError::NoLeader,
        OpenRaftError::Fatal(e) => fatal(e),
    }
}

fn server_state(state: ServerState) -> RaftState {
    match state {
        ServerState::Leader => RaftState::Leader,
        ServerState::Candidate => RaftState::Candidate,
        ServerState::Follower | ServerState::Learner => RaftState::Follower,
        ServerState::Shutdown => RaftState::Shutdown,
    }
}

impl HttpRaftNode {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        storage: Arc<dyn Storage>,
        fsm: Arc<dyn StateMachine>,
        client: RaftAdminClient,
    ) -> RaftResult<Arc<Self>> {
        let name = name.into();
        let config = openraft::Config {
            cluster_name: "dgate".to_string(),
            heartbeat_interval: HEARTBEAT_INTERVAL_MS,
            election_timeout_min: ELECTION_TIMEOUT_MIN_MS,
            election_timeout_max: ELECTION_TIMEOUT_MAX_MS,
            snapshot_policy: SnapshotPolicy::Never,
            max_in_snapshot_log_to_keep: u64::MAX,
            ..Default::default()
        }
        .validate()
        .map_err(|e| RaftError::Consensus(e.to_string()))?;
        let log = RaftLogStore::open(storage)?;
        let fsm = FsmStore::new(fsm, log.clone());
        Ok(Arc::new(Self {
            id: node_id(&name),
            name,
            address: address.into(),
            config: Arc::new(config),
            log,
            fsm,
            client,
            raft: OnceCell::new(),
        }))
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn raft_id(&self) -> NodeId {
        self.id
    }

    /// Whether this node has taken part in a cluster before.
    pub fn has_configuration(&self) -> bool {
        !self.log.is_empty()
    }

    fn raft(&self) -> RaftResult<&Raft<TypeConfig>> {
        self.raft.get().ok_or(RaftError::NotStarted)
    }

    fn metrics(&self) -> Option<RaftMetrics<NodeId, MemberNode>> {
        self.raft.get().map(|raft| raft.metrics().borrow().clone())
    }

    /// Start the consensus engine and replay the committed log into the state machine.
    pub async fn start(&self) -> RaftResult<()> {
        if self.raft.get().is_some() {
            return Ok(());
        }
        let committed = self.log.committed_index();
        let raft = Raft::new(
            self.id,
            self.config.clone(),
            self.client.clone(),
            self.log.clone(),
            self.fsm.clone(),
        )
        .await
        .map_err(fatal)?;
        if let Err(raft) = self.raft.set(raft) {
            return raft.shutdown().await.map_err(|e| RaftError::Consensus(e.to_string()));
        }
        tracing::info!(
            id = %self.name,
            raft_id = self.id,
            entries = self.log.len(),
            committed,
            "raft node started"
        );

        if committed > 0 {
            let raft = self.raft()?;
            if let Err(e) = raft
                .wait(Some(REPLAY_TIMEOUT))
                .applied_index_at_least(Some(committed), "replay committed log")
                .await
            {
                tracing::warn!(error = %e, committed, "raft log replay still in progress");
            }
        }
        Ok(())
    }

    /// Wait until some member is known to lead, returning its `(id, address)`.
    pub async fn wait_for_leader(&self, timeout: Duration) -> RaftResult<(String, String)> {
        self.raft()?
            .wait(Some(timeout))
            .metrics(|m| m.current_leader.is_some(), "leader elected")
            .await
            .map_err(|_| RaftError::Timeout(timeout))?;
        self.leader_with_id().ok_or(RaftError::NoLeader)
    }

    pub async fn handle_append(
        &self,
        req: AppendEntriesRequest<TypeConfig>,
    ) -> RaftResult<Result<AppendEntriesResponse<NodeId>, OpenRaftError<NodeId>>> {
        Ok(self.raft()?.append_entries(req).await)
    }

    pub async fn handle_vote(
        &self,
        req: VoteRequest<NodeId>,
    ) -> RaftResult<Result<VoteResponse<NodeId>, OpenRaftError<NodeId>>> {
        Ok(self.raft()?.vote(req).await)
    }

    pub async fn handle_snapshot(
        &self,
        req: InstallSnapshotRequest<TypeConfig>,
    ) -> RaftResult<
        Result<InstallSnapshotResponse<NodeId>, OpenRaftError<NodeId, InstallSnapshotError>>,
    > {
        Ok(self.raft()?.install_snapshot(req).await)
    }

    async fn add_learner(&self, name: &str, address: &str) -> RaftResult<u64> {
        let resp = self
            .raft()?
            .add_learner(node_id(name), MemberNode::new(name, address), true)
            .await
            .map_err(write_err)?;
        Ok(resp.log_id.index)
    }
}

#[async_trait]
impl RaftNode for HttpRaftNode {
    fn id(&self) -> &str {
        &self.name
    }

    fn state(&self) -> RaftState {
        self.metrics()
            .map(|m| server_state(m.state))
            .unwrap_or(RaftState::Follower)
    }

    fn leader_with_id(&self) -> Option<(String, String)> {
        let metrics = self.metrics()?;
        let leader = metrics.current_leader?;
        metrics
            .membership_config
            .membership()
            .get_node(&leader)
            .map(|node| (node.name.clone(), node.addr.clone()))
    }

    async fn apply(&self, data: Vec<u8>, timeout: Duration) -> RaftResult<u64> {
        let raft = self.raft()?;
        let change =
            ChangeRequest(String::from_utf8(data).map_err(|e| RaftError::Apply(e.to_string()))?);
        let resp = tokio::time::timeout(timeout, raft.client_write(change))
            .await
            .map_err(|_| RaftError::Timeout(timeout))?
            .map_err(write_err)?;
        match resp.data.error {
            Some(e) => Err(RaftError::Apply(e)),
            None => Ok(resp.log_id.index),
        }
    }

    async fn barrier(&self, timeout: Duration) -> RaftResult<()> {
        let raft = self.raft()?;
        tokio::time::timeout(timeout, raft.ensure_linearizable())
            .await
            .map_err(|_| RaftError::Timeout(timeout))?
            .map_err(leader_check_err)?;
        Ok(())
    }

    async fn bootstrap(&self, servers: Vec<RaftServer>) -> RaftResult<()> {
        let raft = self.raft()?;
        let members: BTreeMap<NodeId, MemberNode> = servers
            .iter()
            .filter(|s| s.suffrage == Suffrage::Voter)
            .map(|s| (node_id(&s.id), MemberNode::new(&s.id, &s.address)))
            .collect();
        raft.initialize(members).await.map_err(|e| match e {
            OpenRaftError::APIError(InitializeError::NotAllowed(_)) => {
                RaftError::AlreadyBootstrapped
            }
            OpenRaftError::APIError(e) => RaftError::Consensus(e.to_string()),
            OpenRaftError::Fatal(e) => fatal(e),
        })?;
        tracing::info!(id = %self.name, address = %self.address, voters = servers.len(), "bootstrapped cluster");

        if servers.len() == 1 {
            match self.wait_for_leader(BOOTSTRAP_ELECTION_TIMEOUT).await {
                Ok((leader, _)) => tracing::info!(%leader, "leader elected"),
                Err(e) => tracing::warn!(error = %e, "no leader after bootstrap"),
            }
        }
        Ok(())
    }

    async fn add_voter(&self, id: &str, address: &str, timeout: Duration) -> RaftResult<u64> {
        tracing::info!(id, address, "adding voter to cluster");
        let work = async {
            self.add_learner(id, address).await?;
            let resp = self
                .raft()?
                .change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([node_id(id)])), false)
                .await
                .map_err(write_err)?;
            Ok(resp.log_id.index)
        };
        tokio::time::timeout(timeout, work)
            .await
            .map_err(|_| RaftError::Timeout(timeout))?
    }

    async fn add_nonvoter(&self, id: &str, address: &str, timeout: Duration) -> RaftResult<u64> {
        tracing::info!(id, address, "adding non-voter to cluster");
        tokio::time::timeout(timeout, self.add_learner(id, address))
            .await
            .map_err(|_| RaftError::Timeout(timeout))?
    }

    async fn verify_leader(&self) -> RaftResult<()> {
        let raft = self.raft()?;
        if self.state() != RaftState::Leader {
            return Err(match self.leader_with_id() {
                Some((_, addr)) => RaftError::NotLeader { leader: Some(addr) },
                None => RaftError::NoLeader,
            });
        }
        raft.ensure_linearizable().await.map_err(leader_check_err)?;
        Ok(())
    }

    fn configuration(&self) -> Vec<RaftServer> {
        let Some(metrics) = self.metrics() else {
            return Vec::new();
        };
        let membership = metrics.membership_config.membership();
        let voters: BTreeSet<NodeId> = membership.voter_ids().collect();
        membership
            .nodes()
            .map(|(id, node)| RaftServer {
                id: node.name.clone(),
                address: node.addr.clone(),
                suffrage: if voters.contains(id) {
                    Suffrage::Voter
                } else {
                    Suffrage::Nonvoter
                },
            })
            .collect()
    }

    fn last_index(&self) -> u64 {
        self.metrics()
            .and_then(|m| m.last_log_index)
            .unwrap_or_else(|| self.log.last_index())
    }

    fn applied_index(&self) -> u64 {
        self.metrics()
            .and_then(|m| m.last_applied.map(|l| l.index))
            .unwrap_or_else(|| self.fsm.last_applied())
    }

    fn stats(&self) -> BTreeMap<String, String> {
        let mut stats = BTreeMap::new();
        let Some(metrics) = self.metrics() else {
            stats.insert("state".to_string(), "NotStarted".to_string());
            stats.insert("last_log_index".to_string(), self.log.last_index().to_string());
            return stats;
        };
        let configuration = self.configuration();
        stats.insert("state".to_string(), server_state(metrics.state).to_string());
        stats.insert("term".to_string(), metrics.current_term.to_string());
        stats.insert(
            "last_log_index".to_string(),
            metrics.last_log_index.unwrap_or(0).to_string(),
        );
        stats.insert(
            "applied_index".to_string(),
            metrics.last_applied.map(|l| l.index).unwrap_or(0).to_string(),
        );
        stats.insert(
            "commit_index".to_string(),
            self.log.committed_index().to_string(),
        );
        stats.insert(
            "num_peers".to_string(),
            configuration
                .iter()
                .filter(|s| s.id != self.name)
                .count()
                .to_string(),
        );
        stats.insert(
            "leader_id".to_string(),
            self.leader_with_id().map(|(id, _)| id).unwrap_or_default(),
        );
        stats.insert(
            "last_contact".to_string(),
            match metrics.millis_since_quorum_ack {
                Some(ms) => format!("{ms}ms"),
                None => "never".to_string(),
            },
        );
        stats.insert(
            "latest_configuration".to_string(),
            serde_json::to_string(&configuration).unwrap_or_default(),
        );
        stats
    }

    async fn shutdown(&self) -> RaftResult<()> {
        match self.raft.get() {
            Some(raft) => raft
                .shutdown()
                .await
                .map_err(|e| RaftError::Consensus(e.to_string())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::{
        adapters::storage::MemoryStorage,
        ports::raft::{EntryKind, RaftEntry, RaftIndexes},
    };

    const WAIT: Duration = Duration::from_secs(10);

    #[derive(Default)]
    struct RecordingFsm {
        applied: Mutex<Vec<(RaftEntry, RaftIndexes)>>,
    }

    impl RecordingFsm {
        fn commands(&self) -> Vec<Vec<u8>> {
            self.applied
                .lock()
                .iter()
                .filter(|(e, _)| e.kind == EntryKind::Command)
                .map(|(e, _)| e.data.clone())
                .collect()
        }
    }

    #[async_trait]
    impl StateMachine for RecordingFsm {
        async fn apply_batch(
            &self,
            entries: &[RaftEntry],
            indexes: RaftIndexes,
        ) -> Vec<Result<(), String>> {
            let mut applied = self.applied.lock();
            entries
                .iter()
                .map(|e| {
                    applied.push((e.clone(), indexes));
                    if e.data == b"bad" {
                        Err("rejected".to_string())
                    } else {
                        Ok(())
                    }
                })
                .collect()
        }
    }

    fn storage() -> Arc<dyn Storage> {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        storage.connect().unwrap();
        storage
    }

    fn node(storage: Arc<dyn Storage>, fsm: Arc<RecordingFsm>) -> Arc<HttpRaftNode> {
        let client = RaftAdminClient::new("http", None).unwrap();
        HttpRaftNode::new("n1", "127.0.0.1:1", storage, fsm, client).unwrap()
    }

    fn voter(id: &str, address: &str) -> RaftServer {
        RaftServer {
            id: id.to_string(),
            address: address.to_string(),
            suffrage: Suffrage::Voter,
        }
    }

    #[tokio::test]
    async fn test_calls_before_start_fail() {
        let node = node(storage(), Arc::new(RecordingFsm::default()));
        assert!(matches!(
            node.apply(b"x".to_vec(), Duration::from_secs(1)).await,
            Err(RaftError::NotStarted)
        ));
        assert_eq!(node.state(), RaftState::Follower);
        assert!(node.leader_with_id().is_none());
        assert_eq!(node.stats()["state"], "NotStarted");
    }

    #[tokio::test]
    async fn test_bootstrap_then_apply() {
        let fsm = Arc::new(RecordingFsm::default());
        let node = node(storage(), fsm.clone());
        node.start().await.unwrap();

        assert!(matches!(
            node.apply(b"x".to_vec(), Duration::from_secs(1)).await,
            Err(RaftError::NoLeader)
        ));

        node.bootstrap(vec![voter("n1", "127.0.0.1:1")]).await.unwrap();
        let (leader, address) = node.wait_for_leader(WAIT).await.unwrap();
        assert_eq!(leader, "n1");
        assert_eq!(address, "127.0.0.1:1");
        assert_eq!(node.state(), RaftState::Leader);
        assert!(matches!(
            node.bootstrap(vec![voter("n1", "127.0.0.1:1")]).await,
            Err(RaftError::AlreadyBootstrapped)
        ));

        let index = node.apply(b"x".to_vec(), WAIT).await.unwrap();
        assert!(node.applied_index() >= index);
        assert!(matches!(
            node.apply(b"bad".to_vec(), WAIT).await,
            Err(RaftError::Apply(e)) if e == "rejected"
        ));
        node.barrier(WAIT).await.unwrap();
        node.verify_leader().await.unwrap();
        assert_eq!(fsm.commands(), vec![b"x".to_vec(), b"bad".to_vec()]);

        let config = node.configuration();
        assert_eq!(config, vec![voter("n1", "127.0.0.1:1")]);
        assert_eq!(node.stats()["leader_id"], "n1");
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_replays_committed_log() {
        let storage = storage();
        let first = node(storage.clone(), Arc::new(RecordingFsm::default()));
        first.start().await.unwrap();
        first.bootstrap(vec![voter("n1", "127.0.0.1:1")]).await.unwrap();
        first.wait_for_leader(WAIT).await.unwrap();
        for _ in 0..4 {
            first.apply(b"x".to_vec(), WAIT).await.unwrap();
        }
        let last = first.last_index();
        first.shutdown().await.unwrap();

        let fsm = Arc::new(RecordingFsm::default());
        let second = node(storage, fsm.clone());
        assert!(second.has_configuration());
        second.start().await.unwrap();
        assert_eq!(fsm.commands().len(), 4);
        let replayed = fsm.applied.lock().clone();
        assert!(replayed.iter().all(|(_, idx)| idx.applied_index > 0 && idx.applied_index <= last));
        second.wait_for_leader(WAIT).await.unwrap();
        assert_eq!(second.state(), RaftState::Leader);
        second.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_entries_without_quorum_are_never_applied() {
        let fsm = Arc::new(RecordingFsm::default());
        let node = node(storage(), fsm.clone());
        node.start().await.unwrap();
        // Two of three voters are unreachable.
        node.bootstrap(vec![
            voter("n1", "127.0.0.1:1"),
            voter("n2", "127.0.0.1:2"),
            voter("n3", "127.0.0.1:3"),
        ])
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(ELECTION_TIMEOUT_MAX_MS * 2)).await;
        assert_ne!(node.state(), RaftState::Leader);
        assert!(node.leader_with_id().is_none());
        assert!(matches!(
            node.apply(b"x".to_vec(), Duration::from_secs(2)).await,
            Err(RaftError::NoLeader | RaftError::NotLeader { .. } | RaftError::Timeout(_))
        ));
        assert!(matches!(
            node.barrier(Duration::from_secs(2)).await,
            Err(RaftError::NoLeader | RaftError::NotLeader { .. } | RaftError::Timeout(_))
        ));
        assert!(fsm.commands().is_empty());
        node.shutdown().await.unwrap();
    }
}
