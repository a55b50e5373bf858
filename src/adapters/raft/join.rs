//! Cluster formation: bootstrap a new cluster or ask an existing leader to add this node.
use std::{sync::Arc, time::Duration};

use super::{
    network::{AddServerRequest, RaftAdminClient},
    node::HttpRaftNode,
};
use crate::{
    config::ReplicationConfig,
    ports::raft::{RaftError, RaftNode, RaftResult, RaftServer, Suffrage},
};

const JOIN_RETRY_DELAY: Duration = Duration::from_secs(3);
const JOIN_MAX_RETRIES: usize = 15;

/// Bootstrap the cluster, or join it when no local configuration exists yet.
pub async fn form_cluster(
    node: Arc<HttpRaftNode>,
    client: RaftAdminClient,
    replication: ReplicationConfig,
    admin_port: u16,
    watch_only: bool,
) -> RaftResult<()> {
    if node.has_configuration() {
        tracing::info!(id = %node.id(), "existing raft configuration found");
        return Ok(());
    }
    if replication.bootstrap_cluster {
        tracing::info!(id = %node.id(), address = %node.address(), "bootstrapping cluster");
        return node
            .bootstrap(vec![RaftServer {
                id: node.id().to_string(),
                address: node.address().to_string(),
                suffrage: Suffrage::Voter,
            }])
            .await;
    }

    let addresses = discover(&replication, admin_port).await?;
    if addresses.is_empty() {
        tracing::warn!("no admin urls specified, waiting to be added to cluster");
        return Ok(());
    }
    join(&node, &client, &addresses, watch_only, JOIN_RETRY_DELAY).await
}

/// Candidate admin addresses from DNS discovery followed by the static list.
async fn discover(replication: &ReplicationConfig, admin_port: u16) -> RaftResult<Vec<String>> {
    let mut addresses = Vec::new();
    if let Some(domain) = replication.discovery_domain.as_deref() {
        let domain = domain.trim_end_matches('.');
        tracing::debug!(domain, "no previous configuration found, attempting to discover cluster");
        let found = tokio::net::lookup_host((domain, admin_port))
            .await
            .map_err(|e| RaftError::Transport(format!("lookup {domain}: {e}")))?;
        addresses.extend(found.map(|addr| addr.to_string()));
        if addresses.is_empty() {
            return Err(RaftError::Transport(format!("no addrs found for {domain}")));
        }
        tracing::info!(?addresses, "discovered addresses");
    }
    addresses.extend(replication.cluster_address.iter().cloned());
    Ok(addresses)
}

async fn join(
    node: &HttpRaftNode,
    client: &RaftAdminClient,
    addresses: &[String],
    watch_only: bool,
    retry_delay: Duration,
) -> RaftResult<()> {
    let request = AddServerRequest {
        id: node.id().to_string(),
        address: node.address().to_string(),
    };
    let mut retries = 0;
    'retry: loop {
        for addr in addresses {
            match client.verify_leader(addr).await {
                Ok(()) => {}
                Err(RaftError::NotLeader { .. }) => continue,
                Err(e) if retries >= JOIN_MAX_RETRIES => {
                    tracing::error!(url = %addr, error = %e, "skipping verifying leader");
                    continue;
                }
                Err(e) => {
                    retries += 1;
                    tracing::debug!(url = %addr, error = %e, retries, "retrying verifying leader");
                    tokio::time::sleep(retry_delay).await;
                    continue 'retry;
                }
            }
            let index = if watch_only {
                tracing::info!(id = %request.id, url = %addr, "adding non-voter");
                client.add_nonvoter(addr, &request).await?
            } else {
                tracing::info!(id = %request.id, url = %addr, "adding voter");
                client.add_voter(addr, &request).await?
            };
            tracing::info!(index, leader = %addr, "joined cluster");
            return Ok(());
        }
        return Err(RaftError::NoLeader);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_discover_static_addresses() {
        let replication = ReplicationConfig {
            cluster_address: vec!["10.0.0.1:9080".into(), "10.0.0.2:9080".into()],
            ..Default::default()
        };
        let addrs = discover(&replication, 9080).await.unwrap();
        assert_eq!(addrs, vec!["10.0.0.1:9080", "10.0.0.2:9080"]);
    }

    #[tokio::test]
    async fn test_discover_resolves_domain() {
        let replication = ReplicationConfig {
            discovery_domain: Some("localhost.".into()),
            ..Default::default()
        };
        let addrs = discover(&replication, 9080).await.unwrap();
        assert!(addrs.iter().all(|a| a.ends_with(":9080")));
        assert!(!addrs.is_empty());
    }
}
