//! Raft log, vote and commit marker kept in the node's storage under `raft/`.
//!
//! Everything is mirrored in memory; storage is only read when the store is opened.
use std::{collections::BTreeMap, fmt::Debug, ops::RangeBounds, sync::Arc};

use openraft::{
    Entry, LogId, OptionalSend, StorageError, StorageIOError, Vote,
    storage::{LogFlushed, LogState, RaftLogReader, RaftLogStorage},
};
use parking_lot::RwLock;
use serde::{Serialize, de::DeserializeOwned};

use super::{NodeId, TypeConfig};
use crate::ports::{
    raft::RaftResult,
    storage::{BatchOp, Storage, StorageError as StoreError},
};

pub const RAFT_LOG_PREFIX: &str = "raft/log/";
const VOTE_KEY: &str = "raft/meta/vote";
const COMMITTED_KEY: &str = "raft/meta/committed";
const PURGED_KEY: &str = "raft/meta/purged";

fn entry_key(index: u64) -> String {
    format!("{RAFT_LOG_PREFIX}{index:020}")
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|e| StoreError::Corrupted(format!("encode raft state: {e}")))
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupted(format!("{key}: {e}")))
}

fn load<T: DeserializeOwned>(storage: &dyn Storage, key: &str) -> Result<Option<T>, StoreError> {
    storage
        .get(key)?
        .map(|bytes| decode(key, &bytes))
        .transpose()
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<u64, Entry<TypeConfig>>,
    vote: Option<Vote<NodeId>>,
    committed: Option<LogId<NodeId>>,
    purged: Option<LogId<NodeId>>,
}

/// Log store shared by openraft's log task, its readers and the state machine.
#[derive(Clone)]
pub struct RaftLogStore {
    storage: Arc<dyn Storage>,
    inner: Arc<RwLock<Inner>>,
}

impl RaftLogStore {
    /// Open the store, loading every persisted entry.
    pub fn open(storage: Arc<dyn Storage>) -> RaftResult<Self> {
        let mut inner = Inner::default();
        for (key, bytes) in storage.get_prefix(RAFT_LOG_PREFIX, 0, 0)? {
            let entry: Entry<TypeConfig> = decode(&key, &bytes)?;
            inner.entries.insert(entry.log_id.index, entry);
        }
        inner.vote = load(storage.as_ref(), VOTE_KEY)?;
        inner.committed = load(storage.as_ref(), COMMITTED_KEY)?;
        inner.purged = load(storage.as_ref(), PURGED_KEY)?;
        Ok(Self {
            storage,
            inner: Arc::new(RwLock::new(inner)),
        })
    }

    /// Index of the newest entry, `0` for an empty log.
    pub fn last_index(&self) -> u64 {
        self.inner
            .read()
            .entries
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0)
    }

    /// Index recorded as committed when the store was last written.
    pub fn committed_index(&self) -> u64 {
        self.inner.read().committed.map(|c| c.index).unwrap_or(0)
    }

    /// True until the first entry has been written.
    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        self.storage.set(key, &encode(value)?)
    }
}

fn write_err(e: &StoreError) -> StorageError<NodeId> {
    StorageIOError::write_logs(e).into()
}

impl RaftLogReader<TypeConfig> for RaftLogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
        let inner = self.inner.read();
        Ok(inner.entries.range(range).map(|(_, e)| e.clone()).collect())
    }
}

impl RaftLogStorage<TypeConfig> for RaftLogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let inner = self.inner.read();
        let last_purged_log_id = inner.purged;
        let last_log_id = inner
            .entries
            .values()
            .next_back()
            .map(|e| e.log_id)
            .or(last_purged_log_id);
        Ok(LogState {
            last_purged_log_id,
            last_log_id,
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.put(VOTE_KEY, vote)
            .map_err(|e| StorageIOError::write_vote(&e))?;
        self.inner.write().vote = Some(vote.clone());
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        Ok(self.inner.read().vote.clone())
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), StorageError<NodeId>> {
        self.put(COMMITTED_KEY, &committed).map_err(|e| write_err(&e))?;
        self.inner.write().committed = committed;
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        Ok(self.inner.read().committed)
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let entries: Vec<Entry<TypeConfig>> = entries.into_iter().collect();
        let mut ops = Vec::with_capacity(entries.len());
        for entry in &entries {
            ops.push(BatchOp::Set {
                key: entry_key(entry.log_id.index),
                value: encode(entry).map_err(|e| write_err(&e))?,
            });
        }
        self.storage.apply_batch(ops).map_err(|e| write_err(&e))?;
        {
            let mut inner = self.inner.write();
            for entry in entries {
                inner.entries.insert(entry.log_id.index, entry);
            }
        }
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        tracing::debug!(index = log_id.index, "truncating raft log");
        let doomed: Vec<u64> = self
            .inner
            .read()
            .entries
            .range(log_id.index..)
            .map(|(index, _)| *index)
            .collect();
        let ops = doomed
            .iter()
            .map(|index| BatchOp::Delete {
                key: entry_key(*index),
            })
            .collect();
        self.storage.apply_batch(ops).map_err(|e| write_err(&e))?;
        let mut inner = self.inner.write();
        for index in doomed {
            inner.entries.remove(&index);
        }
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        tracing::debug!(index = log_id.index, "purging raft log");
        let doomed: Vec<u64> = self
            .inner
            .read()
            .entries
            .range(..=log_id.index)
            .map(|(index, _)| *index)
            .collect();
        let mut ops: Vec<BatchOp> = doomed
            .iter()
            .map(|index| BatchOp::Delete {
                key: entry_key(*index),
            })
            .collect();
        ops.push(BatchOp::Set {
            key: PURGED_KEY.to_string(),
            value: encode(&Some(log_id)).map_err(|e| write_err(&e))?,
        });
        self.storage.apply_batch(ops).map_err(|e| write_err(&e))?;
        let mut inner = self.inner.write();
        for index in doomed {
            inner.entries.remove(&index);
        }
        inner.purged = Some(log_id);
        Ok(())
    }
}
