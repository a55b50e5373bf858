//! Ordered key-value persistence port.
//!
//! The gateway only needs a handful of primitives from its storage engine: point reads and
//! writes, ordered prefix scans and an atomic batch. Everything else (change-log persistence,
//! documents, replicated log state) is layered on top of these.
use thiserror::Error;

/// Errors surfaced by a [`Storage`] implementation
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StorageError {
    /// The engine was used before [`Storage::connect`] succeeded
    #[error("storage is not connected")]
    NotConnected,

    /// Underlying I/O failure
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk data failed an integrity check
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// Configuration of the engine is unusable
    #[error("storage misconfigured: {0}")]
    Config(String),
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// A single mutation inside an atomic batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Set { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl BatchOp {
    pub fn key(&self) -> &str {
        match self {
            BatchOp::Set { key, .. } | BatchOp::Delete { key } => key,
        }
    }
}

/// Storage defines the port for the embedded key-value engine.
///
/// Keys are ordered byte-wise; every write is atomic per key and [`Storage::apply_batch`]
/// is atomic across keys.
pub trait Storage: Send + Sync + 'static {
    /// Open (or create) the underlying engine. Must be called once before use.
    fn connect(&self) -> StorageResult<()>;

    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> StorageResult<()>;

    /// Values whose key starts with `prefix`, in key order, skipping the first `offset`
    /// matches and returning at most `limit` (`0` means unbounded).
    fn get_prefix(
        &self,
        prefix: &str,
        offset: usize,
        limit: usize,
    ) -> StorageResult<Vec<(String, Vec<u8>)>>;

    /// Walk every key under `prefix` in order until the visitor returns `false`.
    fn iterate_prefix(
        &self,
        prefix: &str,
        visit: &mut dyn FnMut(&str, &[u8]) -> bool,
    ) -> StorageResult<()>;

    /// Apply all operations atomically.
    fn apply_batch(&self, ops: Vec<BatchOp>) -> StorageResult<()>;

    fn close(&self) -> StorageResult<()>;
}

/// Write set accumulated by [`with_txn`]. Reads observe the pending writes first.
pub struct Txn<'a, S: Storage + ?Sized> {
    storage: &'a S,
    ops: Vec<BatchOp>,
}

impl<S: Storage + ?Sized> Txn<'_, S> {
    pub fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        if let Some(op) = self.ops.iter().rev().find(|op| op.key() == key) {
            return Ok(match op {
                BatchOp::Set { value, .. } => Some(value.clone()),
                BatchOp::Delete { .. } => None,
            });
        }
        self.storage.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Set {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.ops.push(BatchOp::Delete { key: key.into() });
    }
}

/// Run `f` against a transaction and commit its writes atomically when it succeeds.
/// Nothing is written when `f` returns an error.
pub fn with_txn<S, T, F>(storage: &S, f: F) -> StorageResult<T>
where
    S: Storage + ?Sized,
    F: FnOnce(&mut Txn<'_, S>) -> StorageResult<T>,
{
    let mut txn = Txn {
        storage,
        ops: Vec::new(),
    };
    let out = f(&mut txn)?;
    if !txn.ops.is_empty() {
        storage.apply_batch(txn.ops)?;
    }
    Ok(out)
}
