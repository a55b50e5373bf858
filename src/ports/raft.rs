//! Consensus port.
//!
//! The replication coordinator only relies on the narrow contract below: submit an entry and
//! wait for it to be applied, wait on a barrier, know who the leader is, and manage
//! membership. Entries reach the state machine in index order through [`StateMachine`].
use std::{collections::BTreeMap, fmt, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::storage::StorageError;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RaftError {
    /// This node is not the leader; carries the leader's advertised address when known
    #[error("node is not the leader")]
    NotLeader { leader: Option<String> },

    #[error("raft: no leader")]
    NoLeader,

    #[error("raft node not started")]
    NotStarted,

    #[error("raft operation timed out after {0:?}")]
    Timeout(Duration),

    /// The state machine rejected the entry
    #[error("apply failed: {0}")]
    Apply(String),

    #[error("raft transport error: {0}")]
    Transport(String),

    #[error("raft log store error: {0}")]
    Storage(#[from] StorageError),

    /// Failure reported by the consensus engine itself
    #[error("raft: {0}")]
    Consensus(String),

    #[error("cluster already bootstrapped")]
    AlreadyBootstrapped,

    #[error("raft is shut down")]
    Shutdown,
}

pub type RaftResult<T> = Result<T, RaftError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftState {
    Follower,
    Candidate,
    Leader,
    Shutdown,
}

impl fmt::Display for RaftState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RaftState::Follower => "Follower",
            RaftState::Candidate => "Candidate",
            RaftState::Leader => "Leader",
            RaftState::Shutdown => "Shutdown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Suffrage {
    Voter,
    Nonvoter,
}

/// A cluster member as recorded in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftServer {
    pub id: String,
    pub address: String,
    pub suffrage: Suffrage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Command,
    Configuration,
    /// Written by a new leader to commit entries of earlier terms
    Noop,
}

/// A committed log entry handed to the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftEntry {
    pub index: u64,
    pub kind: EntryKind,
    #[serde(default)]
    pub data: Vec<u8>,
}

/// Log positions visible to the state machine while it applies a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RaftIndexes {
    /// Highest index applied before this process started
    pub applied_index: u64,
    /// Highest index known to exist in the cluster log
    pub last_index: u64,
    pub commit_index: u64,
}

/// Finite state machine fed by the consensus layer.
#[async_trait]
pub trait StateMachine: Send + Sync + 'static {
    /// Apply entries in index order; one result per entry.
    async fn apply_batch(&self, entries: &[RaftEntry], indexes: RaftIndexes)
    -> Vec<Result<(), String>>;
}

#[async_trait]
pub trait RaftNode: Send + Sync + 'static {
    fn id(&self) -> &str;

    fn state(&self) -> RaftState;

    /// `(id, address)` of the current leader, if one is known.
    fn leader_with_id(&self) -> Option<(String, String)>;

    /// Submit an entry and wait until it has been applied locally.
    async fn apply(&self, data: Vec<u8>, timeout: Duration) -> RaftResult<u64>;

    /// Wait until every entry committed before the call has been applied.
    async fn barrier(&self, timeout: Duration) -> RaftResult<()>;

    /// Start a new cluster with the given members. Fails once a configuration exists.
    async fn bootstrap(&self, servers: Vec<RaftServer>) -> RaftResult<()>;

    async fn add_voter(&self, id: &str, address: &str, timeout: Duration) -> RaftResult<u64>;

    async fn add_nonvoter(&self, id: &str, address: &str, timeout: Duration) -> RaftResult<u64>;

    /// Confirm leadership; errors with [`RaftError::NotLeader`] otherwise.
    async fn verify_leader(&self) -> RaftResult<()>;

    fn configuration(&self) -> Vec<RaftServer>;

    fn last_index(&self) -> u64;

    fn applied_index(&self) -> u64;

    fn stats(&self) -> BTreeMap<String, String>;

    async fn shutdown(&self) -> RaftResult<()>;
}
