pub mod file;
pub mod memory;

use std::sync::Arc;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use crate::{
    config::{StorageConfig, StorageKind},
    ports::storage::{Storage, StorageError, StorageResult},
};

/// Build the storage engine selected by configuration. The engine is not yet connected.
pub fn storage_from_config(config: &StorageConfig) -> StorageResult<Arc<dyn Storage>> {
    match config.kind {
        StorageKind::Memory => Ok(Arc::new(MemoryStorage::new())),
        StorageKind::File => {
            let dir = config
                .dir
                .as_deref()
                .filter(|d| !d.is_empty())
                .ok_or_else(|| StorageError::Config("file storage requires `dir`".into()))?;
            Ok(Arc::new(FileStorage::new(dir)))
        }
    }
}
