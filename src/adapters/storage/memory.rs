use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::ports::storage::{BatchOp, Storage, StorageResult};

/// Volatile storage backed by an ordered map. Everything is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

pub(crate) fn scan_prefix<'a>(
    entries: &'a BTreeMap<String, Vec<u8>>,
    prefix: &'a str,
) -> impl Iterator<Item = (&'a String, &'a Vec<u8>)> + 'a {
    entries
        .range(prefix.to_string()..)
        .take_while(move |(key, _)| key.starts_with(prefix))
}

pub(crate) fn page(
    entries: &BTreeMap<String, Vec<u8>>,
    prefix: &str,
    offset: usize,
    limit: usize,
) -> Vec<(String, Vec<u8>)> {
    let limit = if limit == 0 { usize::MAX } else { limit };
    scan_prefix(entries, prefix)
        .skip(offset)
        .take(limit)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

pub(crate) fn apply_ops(entries: &mut BTreeMap<String, Vec<u8>>, ops: Vec<BatchOp>) {
    for op in ops {
        match op {
            BatchOp::Set { key, value } => {
                entries.insert(key, value);
            }
            BatchOp::Delete { key } => {
                entries.remove(&key);
            }
        }
    }
}

impl Storage for MemoryStorage {
    fn connect(&self) -> StorageResult<()> {
        Ok(())
    }

    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn get_prefix(
        &self,
        prefix: &str,
        offset: usize,
        limit: usize,
    ) -> StorageResult<Vec<(String, Vec<u8>)>> {
        Ok(page(&self.entries.read(), prefix, offset, limit))
    }

    fn iterate_prefix(
        &self,
        prefix: &str,
        visit: &mut dyn FnMut(&str, &[u8]) -> bool,
    ) -> StorageResult<()> {
        let entries = self.entries.read();
        for (key, value) in scan_prefix(&entries, prefix) {
            if !visit(key, value) {
                break;
            }
        }
        Ok(())
    }

    fn apply_batch(&self, ops: Vec<BatchOp>) -> StorageResult<()> {
        apply_ops(&mut self.entries.write(), ops);
        Ok(())
    }

    fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::storage::with_txn;

    #[test]
    fn test_prefix_scan_is_ordered_and_bounded() {
        let storage = MemoryStorage::new();
        for id in ["c", "a", "b", "d"] {
            storage.set(&format!("changelog/{id}"), id.as_bytes()).unwrap();
        }
        storage.set("doc/x", b"other").unwrap();

        let all = storage.get_prefix("changelog/", 0, 0).unwrap();
        let keys: Vec<_> = all.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec!["changelog/a", "changelog/b", "changelog/c", "changelog/d"]
        );

        let page = storage.get_prefix("changelog/", 1, 2).unwrap();
        assert_eq!(page[0].1, b"b");
        assert_eq!(page[1].1, b"c");
        assert_eq!(page.len(), 2);
    }

    #[test]
    fn test_iterate_prefix_stops_early() {
        let storage = MemoryStorage::new();
        for i in 0..5 {
            storage.set(&format!("k/{i}"), b"v").unwrap();
        }
        let mut seen = 0;
        storage
            .iterate_prefix("k/", &mut |_: &str, _: &[u8]| {
                seen += 1;
                seen < 3
            })
            .unwrap();
        assert_eq!(seen, 3);
    }

    #[test]
    fn test_txn_commits_only_on_success() {
        let storage = MemoryStorage::new();
        storage.set("a", b"1").unwrap();

        let failed: StorageResult<()> = with_txn(&storage, |txn| {
            txn.set("b", b"2".to_vec());
            Err(crate::ports::storage::StorageError::Corrupted("boom".into()))
        });
        assert!(failed.is_err());
        assert_eq!(storage.get("b").unwrap(), None);

        with_txn(&storage, |txn| {
            assert_eq!(txn.get("a")?, Some(b"1".to_vec()));
            txn.delete("a");
            assert_eq!(txn.get("a")?, None);
            txn.set("b", b"2".to_vec());
            Ok(())
        })
        .unwrap();
        assert_eq!(storage.get("a").unwrap(), None);
        assert_eq!(storage.get("b").unwrap(), Some(b"2".to_vec()));
    }
}
