// # Memory Persistent Store
//
// In-memory implementation of PersistentStore.
//
// ## Crash Behavior
//
// - Everything is lost on restart
// - A redirected endpoint is forgotten; the device reconnects to its
//   configured endpoint
// - The restart counter starts over
//
// ## When to Use
//
// - Testing environments
// - Proxy devices, which never redirect on their own

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::Error;
use crate::traits::persistent_store::{PersistentData, PersistentStore};

/// In-memory persistent store
///
/// Clones share the same data, so a test can keep a handle and inspect
/// what the engine saved.
///
/// # Example
///
/// ```rust,no_run
/// use udmi_core::store::MemoryPersistentStore;
/// use udmi_core::traits::PersistentStore;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = MemoryPersistentStore::new();
///
///     let mut data = store.load().await?;
///     data.restart_count += 1;
///     store.save(&data).await?;
///
///     assert_eq!(store.load().await?.restart_count, 1);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryPersistentStore {
    inner: Arc<RwLock<PersistentData>>,
}

impl MemoryPersistentStore {
    /// Create a new empty memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with data (simulates a previous run)
    pub fn with_data(data: PersistentData) -> Self {
        Self {
            inner: Arc::new(RwLock::new(data)),
        }
    }

    /// Snapshot of the stored data
    pub async fn snapshot(&self) -> PersistentData {
        self.inner.read().await.clone()
    }
}

#[async_trait]
impl PersistentStore for MemoryPersistentStore {
    async fn load(&self) -> Result<PersistentData, Error> {
        Ok(self.inner.read().await.clone())
    }

    async fn save(&self, data: &PersistentData) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        *guard = data.clone();
        Ok(())
    }

    async fn flush(&self) -> Result<(), Error> {
        // Nothing buffered
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EndpointConfiguration;

    #[tokio::test]
    async fn test_memory_store_basic() {
        let store = MemoryPersistentStore::new();

        // Initially defaults
        let data = store.load().await.unwrap();
        assert_eq!(data, PersistentData::default());

        let data = PersistentData {
            endpoint: Some(EndpointConfiguration::new("memory", "broker-b")),
            restart_count: 3,
            last_start: None,
        };
        store.save(&data).await.unwrap();

        // Clones see the same data
        let handle = store.clone();
        assert_eq!(handle.snapshot().await, data);
        assert!(store.flush().await.is_ok());
    }
}
