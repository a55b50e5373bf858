//! Document persistence keyed by `doc/{namespace}/{collection}/{id}`.
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;

use super::resources::Document;
use crate::ports::storage::{Storage, StorageError, with_txn};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DocumentError {
    #[error("document storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("document {key} is not valid json: {source}")]
    Encoding {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type DocumentResult<T> = Result<T, DocumentError>;

pub fn document_key(namespace: &str, collection: &str, id: &str) -> String {
    format!("doc/{namespace}/{collection}/{id}")
}

fn collection_prefix(namespace: &str, collection: &str) -> String {
    format!("doc/{namespace}/{collection}/")
}

#[derive(Clone)]
pub struct DocumentStore {
    storage: Arc<dyn Storage>,
}

impl DocumentStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    fn decode(key: &str, bytes: &[u8]) -> DocumentResult<Document> {
        serde_json::from_slice(bytes).map_err(|source| DocumentError::Encoding {
            key: key.to_string(),
            source,
        })
    }

    /// Insert or replace a document. `created_at` survives replacement; `updated_at` is bumped.
    pub fn store(&self, document: &Document) -> DocumentResult<Document> {
        let key = document_key(&document.namespace, &document.collection, &document.id);
        let stored = with_txn(self.storage.as_ref(), |txn| {
            let now = Utc::now();
            let mut doc = document.clone();
            let previous = txn.get(&key)?.and_then(|b| serde_json::from_slice::<Document>(&b).ok());
            doc.created_at = previous
                .and_then(|p| p.created_at)
                .or(document.created_at)
                .or(Some(now));
            doc.updated_at = Some(now);
            match serde_json::to_vec(&doc) {
                Ok(bytes) => txn.set(key.clone(), bytes),
                Err(e) => {
                    return Err(StorageError::Corrupted(format!(
                        "cannot encode document {key}: {e}"
                    )));
                }
            }
            Ok(doc)
        })?;
        Ok(stored)
    }

    pub fn fetch_by_id(
        &self,
        namespace: &str,
        collection: &str,
        id: &str,
    ) -> DocumentResult<Option<Document>> {
        let key = document_key(namespace, collection, id);
        match self.storage.get(&key)? {
            Some(bytes) => Self::decode(&key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Documents of a collection in key order, skipping `offset` and returning at most
    /// `limit` (`0` means all).
    pub fn fetch_page(
        &self,
        namespace: &str,
        collection: &str,
        offset: usize,
        limit: usize,
    ) -> DocumentResult<Vec<Document>> {
        let prefix = collection_prefix(namespace, collection);
        let limit = if limit == 0 { usize::MAX } else { limit };
        let mut skipped = 0;
        let mut docs = Vec::new();
        let mut failure = None;
        self.storage.iterate_prefix(&prefix, &mut |key: &str, value: &[u8]| {
            if skipped < offset {
                skipped += 1;
                return true;
            }
            match Self::decode(key, value) {
                Ok(doc) => docs.push(doc),
                Err(e) => {
                    failure = Some(e);
                    return false;
                }
            }
            docs.len() < limit
        })?;
        match failure {
            Some(e) => Err(e),
            None => Ok(docs),
        }
    }

    /// Returns whether the document existed.
    pub fn delete(&self, namespace: &str, collection: &str, id: &str) -> DocumentResult<bool> {
        let key = document_key(namespace, collection, id);
        let existed = self.storage.get(&key)?.is_some();
        if existed {
            self.storage.delete(&key)?;
        }
        Ok(existed)
    }

    pub fn delete_all_in_collection(
        &self,
        namespace: &str,
        collection: &str,
    ) -> DocumentResult<usize> {
        let keys: Vec<String> = self
            .storage
            .get_prefix(&collection_prefix(namespace, collection), 0, 0)?
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        let count = keys.len();
        with_txn(self.storage.as_ref(), |txn| {
            for key in keys {
                txn.delete(key);
            }
            Ok(())
        })?;
        Ok(count)
    }

    pub fn has_documents(&self, namespace: &str, collection: &str) -> DocumentResult<bool> {
        Ok(!self
            .storage
            .get_prefix(&collection_prefix(namespace, collection), 0, 1)?
            .is_empty())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::adapters::storage::MemoryStorage;

    fn doc(id: &str, collection: &str) -> Document {
        Document {
            id: id.into(),
            namespace: "n1".into(),
            collection: collection.into(),
            data: json!({ "id": id }),
            ..Default::default()
        }
    }

    #[test]
    fn test_store_preserves_created_at() {
        let store = DocumentStore::new(Arc::new(MemoryStorage::new()));
        let first = store.store(&doc("d1", "users")).unwrap();
        let second = store.store(&doc("d1", "users")).unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(
            store.fetch_by_id("n1", "users", "d1").unwrap().unwrap().data,
            json!({"id": "d1"})
        );
    }

    #[test]
    fn test_paging_is_scoped_to_collection() {
        let store = DocumentStore::new(Arc::new(MemoryStorage::new()));
        for id in ["a", "b", "c", "d"] {
            store.store(&doc(id, "users")).unwrap();
        }
        store.store(&doc("z", "users2")).unwrap();

        let page: Vec<_> = store
            .fetch_page("n1", "users", 1, 2)
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(page, vec!["b", "c"]);
        assert_eq!(store.fetch_page("n1", "users", 0, 0).unwrap().len(), 4);

        assert_eq!(store.delete_all_in_collection("n1", "users").unwrap(), 4);
        assert!(!store.has_documents("n1", "users").unwrap());
        assert!(store.has_documents("n1", "users2").unwrap());
        assert!(!store.delete("n1", "users", "a").unwrap());
    }
}
