//! Replication coordinator and the admin state machine.
//!
//! With replication disabled every change goes straight to the change-log engine and is
//! persisted locally. With replication enabled, changes are submitted to the raft log on the
//! leader and reach the engine through [`AdminFsm`] on every member, in log order.
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use super::{
    change_log::ChangeLog,
    engine::{ApplyOptions, ChangeLogEngine},
    error::{ChangeLogError, ChangeLogResult},
    status::{GatewayStatus, ProxyStatus},
};
use crate::ports::raft::{
    EntryKind, RaftEntry, RaftError, RaftIndexes, RaftNode, RaftState, StateMachine,
};

pub const APPLY_TIMEOUT: Duration = Duration::from_secs(15);
pub const BARRIER_TIMEOUT: Duration = Duration::from_secs(5);

/// State machine fed by the raft log.
pub struct AdminFsm {
    engine: Arc<ChangeLogEngine>,
    status: Arc<GatewayStatus>,
}

impl AdminFsm {
    pub fn new(engine: Arc<ChangeLogEngine>, status: Arc<GatewayStatus>) -> Self {
        Self { engine, status }
    }

    async fn apply_entry(&self, entry: &RaftEntry) -> ChangeLogResult<()> {
        if entry.kind != EntryKind::Command {
            return Ok(());
        }
        let log = ChangeLog::from_bytes(&entry.data)?;
        if log.cmd.is_noop() {
            return Ok(());
        }
        if log.id.is_empty() {
            return Err(ChangeLogError::MissingId);
        }
        self.engine.process(&log, ApplyOptions::REPLAY).await
    }

    /// The batch ending at `index` reaches the catch-up boundary.
    fn is_caught_up(index: u64, indexes: RaftIndexes) -> bool {
        index + 1 >= indexes.last_index && index + 1 >= indexes.applied_index
    }
}

#[async_trait]
impl StateMachine for AdminFsm {
    async fn apply_batch(
        &self,
        entries: &[RaftEntry],
        indexes: RaftIndexes,
    ) -> Vec<Result<(), String>> {
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            let result = self.apply_entry(entry).await;
            if let Err(e) = &result {
                tracing::error!(index = entry.index, error = %e, "error applying raft entry");
            }
            results.push(result.map_err(|e| e.to_string()));
        }

        let Some(last) = entries.last() else {
            return results;
        };
        if self.status.is_ready() {
            if let Err(e) = self.engine.reload_if_pending().await {
                tracing::error!(error = %e, "error reloading after raft batch");
            }
        } else if Self::is_caught_up(last.index, indexes) {
            match self.engine.reload().await {
                Ok(()) => {
                    tracing::info!(index = last.index, "replicated state caught up, proxy ready");
                    self.status.transition(ProxyStatus::Ready);
                    self.status.set_ready(true);
                }
                Err(e) => tracing::error!(error = %e, "error reloading at catch-up boundary"),
            }
        } else {
            tracing::debug!(
                index = last.index,
                last_index = indexes.last_index,
                "replaying raft log"
            );
        }
        results
    }
}

/// Gate between the admin API and the change-log engine.
pub struct ReplicationCoordinator {
    engine: Arc<ChangeLogEngine>,
    raft: Option<Arc<dyn RaftNode>>,
    status: Arc<GatewayStatus>,
}

impl ReplicationCoordinator {
    pub fn new(
        engine: Arc<ChangeLogEngine>,
        raft: Option<Arc<dyn RaftNode>>,
        status: Arc<GatewayStatus>,
    ) -> Self {
        Self {
            engine,
            raft,
            status,
        }
    }

    pub fn engine(&self) -> &Arc<ChangeLogEngine> {
        &self.engine
    }

    pub fn raft(&self) -> Option<&Arc<dyn RaftNode>> {
        self.raft.as_ref()
    }

    pub fn is_replicated(&self) -> bool {
        self.raft.is_some()
    }

    pub fn is_ready(&self) -> bool {
        self.status.is_ready()
    }

    pub fn change_hash(&self) -> u32 {
        self.engine.change_hash()
    }

    /// Apply a change through the replicated log, or locally when replication is off.
    pub async fn apply_change_log(&self, log: &ChangeLog) -> ChangeLogResult<()> {
        let Some(raft) = &self.raft else {
            return self.engine.process(log, ApplyOptions::LOCAL).await;
        };
        if log.cmd.is_noop() {
            return self
                .engine
                .process(
                    log,
                    ApplyOptions {
                        reload: true,
                        persist: false,
                    },
                )
                .await;
        }
        if raft.state() != RaftState::Leader {
            return Err(match raft.leader_with_id() {
                Some((_, address)) => RaftError::NotLeader {
                    leader: Some(address),
                },
                None => RaftError::NoLeader,
            }
            .into());
        }
        let data = log.to_bytes()?;
        let index = raft.apply(data, APPLY_TIMEOUT).await?;
        tracing::debug!(change_id = %log.id, index, "change log committed");
        Ok(())
    }

    /// Wait until everything committed so far is applied locally.
    pub async fn wait_for_changes(&self) -> ChangeLogResult<()> {
        match &self.raft {
            Some(raft) if raft.state() == RaftState::Leader => {
                raft.barrier(BARRIER_TIMEOUT).await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
