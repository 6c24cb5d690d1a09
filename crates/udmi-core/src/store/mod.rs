// # Persistent Store Implementations
//
// This module provides implementations of the PersistentStore trait for
// different persistence strategies.

pub mod file;
pub mod memory;

pub use file::FilePersistentStore;
pub use memory::MemoryPersistentStore;

use std::sync::Arc;

use crate::config::PersistenceConfig;
use crate::error::Result;
use crate::traits::PersistentStore;

/// Open the store described by the device configuration
pub async fn open(config: &PersistenceConfig) -> Result<Arc<dyn PersistentStore>> {
    match config {
        PersistenceConfig::File { path } => Ok(Arc::new(FilePersistentStore::new(path).await?)),
        PersistenceConfig::Memory => Ok(Arc::new(MemoryPersistentStore::new())),
    }
}
