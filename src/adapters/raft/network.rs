//! HTTP transport between admin APIs: raft RPCs (`/raft/*`) and the `/raftadmin/*` calls used
//! to join a cluster.
use std::time::Duration;

use openraft::{
    error::{
        InstallSnapshotError, NetworkError, RPCError, RaftError as OpenRaftError, RemoteError,
        Unreachable,
    },
    network::{RPCOption, RaftNetwork, RaftNetworkFactory},
    raft::{
        AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
        InstallSnapshotResponse, VoteRequest, VoteResponse,
    },
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use super::{MemberNode, NodeId, TypeConfig};
use crate::ports::raft::{RaftError, RaftResult};

pub const SHARED_KEY_HEADER: &str = "X-DGate-Shared-Key";
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

pub const APPEND_PATH: &str = "/raft/append";
pub const VOTE_PATH: &str = "/raft/vote";
pub const SNAPSHOT_PATH: &str = "/raft/snapshot";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddServerRequest {
    pub id: String,
    pub address: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AwaitResponse {
    pub index: u64,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeaderResponse {
    pub id: String,
    pub address: String,
}

/// Client for another node's admin API.
#[derive(Debug, Clone)]
pub struct RaftAdminClient {
    client: reqwest::Client,
    scheme: String,
    shared_key: Option<String>,
}

impl RaftAdminClient {
    pub fn new(scheme: &str, shared_key: Option<String>) -> RaftResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(CLIENT_TIMEOUT)
            .user_agent("dgate")
            .build()
            .map_err(|e| RaftError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            scheme: scheme.to_string(),
            shared_key,
        })
    }

    fn url(&self, address: &str, path: &str) -> String {
        format!("{}://{}{}", self.scheme, address, path)
    }

    fn post(&self, address: &str, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.post(self.url(address, path));
        match &self.shared_key {
            Some(key) => builder.header(SHARED_KEY_HEADER, key),
            None => builder,
        }
    }

    fn get(&self, address: &str, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.get(self.url(address, path));
        match &self.shared_key {
            Some(key) => builder.header(SHARED_KEY_HEADER, key),
            None => builder,
        }
    }

    /// `Ok` when the node at `address` is the leader.
    pub async fn verify_leader(&self, address: &str) -> RaftResult<()> {
        let resp = self
            .get(address, "/raftadmin/VerifyLeader")
            .send()
            .await
            .map_err(transport_err)?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::CONFLICT => {
                let leader = resp.json::<LeaderResponse>().await.ok();
                Err(RaftError::NotLeader {
                    leader: leader.map(|l| l.address).filter(|a| !a.is_empty()),
                })
            }
            s => Err(RaftError::Transport(format!(
                "verify leader at {address} failed with status {s}"
            ))),
        }
    }

    pub async fn add_voter(&self, address: &str, req: &AddServerRequest) -> RaftResult<u64> {
        self.add_server(address, "/raftadmin/AddVoter", req).await
    }

    pub async fn add_nonvoter(&self, address: &str, req: &AddServerRequest) -> RaftResult<u64> {
        self.add_server(address, "/raftadmin/AddNonvoter", req).await
    }

    async fn add_server(
        &self,
        address: &str,
        path: &str,
        req: &AddServerRequest,
    ) -> RaftResult<u64> {
        let resp = self
            .post(address, path)
            .json(req)
            .send()
            .await
            .map_err(transport_err)?;
        let status = resp.status();
        let body: AwaitResponse = resp.json().await.unwrap_or_default();
        if !status.is_success() || !body.error.is_empty() {
            return Err(RaftError::Transport(format!(
                "{path} on {address} failed ({status}): {}",
                body.error
            )));
        }
        Ok(body.index)
    }

    /// POST a raft RPC; the peer answers with a serialized `Result<Resp, Err>`.
    async fn raft_rpc<Req, Resp, E>(
        &self,
        target: NodeId,
        node: &MemberNode,
        path: &str,
        req: &Req,
        timeout: Duration,
    ) -> Result<Resp, RPCError<NodeId, MemberNode, E>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        E: std::error::Error + DeserializeOwned,
    {
        let resp = self
            .post(&node.addr, path)
            .timeout(timeout)
            .json(req)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    RPCError::Unreachable(Unreachable::new(&e))
                } else {
                    RPCError::Network(NetworkError::new(&e))
                }
            })?;
        if !resp.status().is_success() {
            let e = std::io::Error::other(format!(
                "{path} on {} failed with status {}",
                node.addr,
                resp.status()
            ));
            return Err(RPCError::Network(NetworkError::new(&e)));
        }
        let result: Result<Resp, E> = resp
            .json()
            .await
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))?;
        result.map_err(|e| RPCError::RemoteError(RemoteError::new_with_node(target, node.clone(), e)))
    }
}

fn transport_err(e: reqwest::Error) -> RaftError {
    if e.is_timeout() {
        RaftError::Timeout(CLIENT_TIMEOUT)
    } else {
        RaftError::Transport(e.to_string())
    }
}

impl RaftNetworkFactory<TypeConfig> for RaftAdminClient {
    type Network = PeerConnection;

    async fn new_client(&mut self, target: NodeId, node: &MemberNode) -> Self::Network {
        PeerConnection {
            client: self.clone(),
            target,
            node: node.clone(),
        }
    }
}

/// Outbound raft RPCs to one member.
pub struct PeerConnection {
    client: RaftAdminClient,
    target: NodeId,
    node: MemberNode,
}

impl RaftNetwork<TypeConfig> for PeerConnection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, MemberNode, OpenRaftError<NodeId>>>
    {
        self.client
            .raft_rpc(self.target, &self.node, APPEND_PATH, &rpc, option.hard_ttl())
            .await
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, MemberNode, OpenRaftError<NodeId, InstallSnapshotError>>,
    > {
        self.client
            .raft_rpc(self.target, &self.node, SNAPSHOT_PATH, &rpc, option.hard_ttl())
            .await
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, MemberNode, OpenRaftError<NodeId>>> {
        self.client
            .raft_rpc(self.target, &self.node, VOTE_PATH, &rpc, option.hard_ttl())
            .await
    }
}

#[cfg(test)]
mod tests {
    use openraft::Vote;

    use super::*;

    #[tokio::test]
    async fn test_unreachable_peer_is_reported() {
        let mut client = RaftAdminClient::new("http", None).unwrap();
        // Nothing listens on port 1.
        let mut peer = client
            .new_client(2, &MemberNode::new("n2", "127.0.0.1:1"))
            .await;
        let err = peer
            .vote(
                VoteRequest::new(Vote::new(1, 1), None),
                RPCOption::new(Duration::from_secs(1)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RPCError::Unreachable(_) | RPCError::Network(_)));
    }
}
