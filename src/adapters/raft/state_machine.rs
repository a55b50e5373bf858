//! Feeds committed openraft entries to the gateway's [`StateMachine`].
//!
//! Applied state is not persisted: the change-log engine is rebuilt from the log on every
//! start, so openraft replays everything up to the recovered commit index.
use std::{io::Cursor, sync::Arc};

use openraft::{
    Entry, EntryPayload, LogId, OptionalSend, StorageError, StorageIOError, StoredMembership,
    storage::{RaftSnapshotBuilder, RaftStateMachine, Snapshot, SnapshotMeta},
};
use parking_lot::Mutex;

use super::{ApplyResponse, MemberNode, NodeId, TypeConfig, log_store::RaftLogStore};
use crate::ports::raft::{EntryKind, RaftEntry, RaftIndexes, StateMachine};

#[derive(Debug, Default, Clone)]
struct Applied {
    last: Option<LogId<NodeId>>,
    membership: StoredMembership<NodeId, MemberNode>,
}

/// openraft state machine over the admin FSM.
#[derive(Clone)]
pub struct FsmStore {
    fsm: Arc<dyn StateMachine>,
    log: RaftLogStore,
    /// Commit index found in the log store when the process started
    recovered: u64,
    applied: Arc<Mutex<Applied>>,
}

impl FsmStore {
    pub fn new(fsm: Arc<dyn StateMachine>, log: RaftLogStore) -> Self {
        let recovered = log.committed_index();
        Self {
            fsm,
            log,
            recovered,
            applied: Arc::new(Mutex::new(Applied::default())),
        }
    }

    pub fn last_applied(&self) -> u64 {
        self.applied.lock().last.map(|l| l.index).unwrap_or(0)
    }

    fn convert(&self, entry: Entry<TypeConfig>) -> RaftEntry {
        let index = entry.log_id.index;
        match entry.payload {
            EntryPayload::Blank => RaftEntry {
                index,
                kind: EntryKind::Noop,
                data: Vec::new(),
            },
            EntryPayload::Normal(change) => RaftEntry {
                index,
                kind: EntryKind::Command,
                data: change.0.into_bytes(),
            },
            EntryPayload::Membership(membership) => {
                let data = serde_json::to_vec(&membership).unwrap_or_default();
                self.applied.lock().membership =
                    StoredMembership::new(Some(entry.log_id), membership);
                RaftEntry {
                    index,
                    kind: EntryKind::Configuration,
                    data,
                }
            }
        }
    }
}

impl RaftSnapshotBuilder<TypeConfig> for FsmStore {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let applied = self.applied.lock().clone();
        let snapshot_id = format!(
            "{}-{}",
            applied.last.map(|l| l.leader_id.term).unwrap_or(0),
            applied.last.map(|l| l.index).unwrap_or(0)
        );
        Ok(Snapshot {
            meta: SnapshotMeta {
                last_log_id: applied.last,
                last_membership: applied.membership,
                snapshot_id,
            },
            snapshot: Box::new(Cursor::new(Vec::new())),
        })
    }
}

impl RaftStateMachine<TypeConfig> for FsmStore {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, MemberNode>), StorageError<NodeId>>
    {
        let applied = self.applied.lock().clone();
        Ok((applied.last, applied.membership))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<ApplyResponse>, StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let mut last = None;
        let batch: Vec<RaftEntry> = entries
            .into_iter()
            .map(|entry| {
                last = Some(entry.log_id);
                self.convert(entry)
            })
            .collect();
        let Some(last) = last else {
            return Ok(Vec::new());
        };

        let indexes = RaftIndexes {
            applied_index: self.recovered,
            last_index: self.log.last_index().max(last.index),
            commit_index: last.index,
        };
        let results = self.fsm.apply_batch(&batch, indexes).await;
        self.applied.lock().last = Some(last);

        let mut responses: Vec<ApplyResponse> = results
            .into_iter()
            .map(|result| ApplyResponse { error: result.err() })
            .collect();
        responses.resize(batch.len(), ApplyResponse::default());
        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, MemberNode>,
        _snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let e = std::io::Error::other(format!(
            "snapshot {} not supported, the log is never purged",
            meta.snapshot_id
        ));
        Err(StorageIOError::read_snapshot(Some(meta.signature()), &e).into())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use openraft::CommittedLeaderId;

    use super::*;
    use crate::{
        adapters::{raft::ChangeRequest, storage::MemoryStorage},
        ports::storage::Storage,
    };

    #[derive(Default)]
    struct RecordingFsm {
        seen: Mutex<Vec<(RaftEntry, RaftIndexes)>>,
    }

    #[async_trait]
    impl StateMachine for RecordingFsm {
        async fn apply_batch(
            &self,
            entries: &[RaftEntry],
            indexes: RaftIndexes,
        ) -> Vec<Result<(), String>> {
            let mut seen = self.seen.lock();
            entries
                .iter()
                .map(|e| {
                    seen.push((e.clone(), indexes));
                    if e.data == b"bad" {
                        Err("rejected".to_string())
                    } else {
                        Ok(())
                    }
                })
                .collect()
        }
    }

    fn log_id(index: u64) -> LogId<NodeId> {
        LogId::new(CommittedLeaderId::new(1, 7), index)
    }

    #[tokio::test]
    async fn test_apply_maps_payloads_and_errors() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        storage.connect().unwrap();
        let log = RaftLogStore::open(storage).unwrap();
        let fsm = Arc::new(RecordingFsm::default());
        let mut store = FsmStore::new(fsm.clone(), log);

        let entries = vec![
            Entry {
                log_id: log_id(1),
                payload: EntryPayload::Blank,
            },
            Entry {
                log_id: log_id(2),
                payload: EntryPayload::Normal(ChangeRequest("ok".into())),
            },
            Entry {
                log_id: log_id(3),
                payload: EntryPayload::Normal(ChangeRequest("bad".into())),
            },
        ];
        let responses = store.apply(entries).await.unwrap();
        assert_eq!(responses.len(), 3);
        assert!(responses[0].error.is_none());
        assert!(responses[1].error.is_none());
        assert_eq!(responses[2].error.as_deref(), Some("rejected"));

        let seen = fsm.seen.lock();
        assert_eq!(seen[0].0.kind, EntryKind::Noop);
        assert_eq!(seen[1].0.kind, EntryKind::Command);
        assert_eq!(seen[1].0.data, b"ok");
        assert_eq!(seen[2].1.commit_index, 3);
        assert_eq!(seen[2].1.last_index, 3);
        drop(seen);

        assert_eq!(store.last_applied(), 3);
        let (applied, _) = store.applied_state().await.unwrap();
        assert_eq!(applied, Some(log_id(3)));
        assert!(store.get_current_snapshot().await.unwrap().is_none());
    }
}
