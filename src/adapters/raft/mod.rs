//! Replicated change log on top of `openraft`.
//!
//! Log entries, the vote and the commit marker live in the node's [`Storage`] under `raft/`.
//! Members talk to each other through the admin API (`/raft/*`), and committed entries are
//! handed to the gateway's [`StateMachine`](crate::ports::raft::StateMachine) in log order.
//!
//! [`Storage`]: crate::ports::storage::Storage
use std::{fmt, io::Cursor};

use serde::{Deserialize, Serialize};

pub mod join;
pub mod log_store;
pub mod network;
pub mod node;
pub mod state_machine;

pub use join::form_cluster;
pub use network::{RaftAdminClient, SHARED_KEY_HEADER};
pub use node::HttpRaftNode;

pub type NodeId = u64;

/// Member record kept in the raft membership: the configured server id and its admin address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberNode {
    pub name: String,
    pub addr: String,
}

impl MemberNode {
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
        }
    }
}

impl fmt::Display for MemberNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.addr)
    }
}

/// A serialized change log carried by a normal entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRequest(pub String);

impl fmt::Display for ChangeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "change({} bytes)", self.0.len())
    }
}

/// State machine verdict for one entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

openraft::declare_raft_types!(
    pub TypeConfig:
        D = ChangeRequest,
        R = ApplyResponse,
        NodeId = NodeId,
        Node = MemberNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = openraft::TokioRuntime
);

/// Numeric raft id for a configured server id. Stable across builds and platforms.
pub fn node_id(name: &str) -> NodeId {
    u64::from(crc32fast::hash(name.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_is_stable() {
        assert_eq!(node_id("node-1"), node_id("node-1"));
        assert_ne!(node_id("node-1"), node_id("node-2"));
        assert_eq!(node_id(""), 0);
    }
}
