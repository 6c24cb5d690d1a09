// # Persistent Store Trait
//
// Defines the interface for data that must survive a device restart.
//
// ## Purpose
//
// The store tracks:
// - The last successfully applied endpoint descriptor
// - The restart counter
// - The start time of the current run
//
// A persisted endpoint takes precedence over the configured one on the
// next start, so a redirect survives a restart.
//
// ## Implementations
//
// - `MemoryPersistentStore`: tests and ephemeral devices
// - `FilePersistentStore`: JSON file with atomic writes and backup recovery

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::EndpointConfiguration;

/// Everything the device persists
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistentData {
    /// Last endpoint successfully applied through a redirect
    #[serde(default)]
    pub endpoint: Option<EndpointConfiguration>,

    /// Number of times the device has started
    #[serde(default)]
    pub restart_count: u32,

    /// Start time of the most recent run
    #[serde(default)]
    pub last_start: Option<DateTime<Utc>>,
}

/// Trait for persistent store implementations
///
/// # Thread Safety
///
/// All methods must be safe to call concurrently from multiple tasks.
///
/// # Implementation Guidelines
///
/// - **Async I/O only**: never block the runtime
/// - **Explicit flush**: `flush()` must persist all pending changes
/// - **No background tasks**: the engine decides when to flush
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Load the persisted data (defaults when nothing was stored yet)
    async fn load(&self) -> Result<PersistentData, crate::Error>;

    /// Replace the persisted data
    async fn save(&self, data: &PersistentData) -> Result<(), crate::Error>;

    /// Persist any pending changes
    async fn flush(&self) -> Result<(), crate::Error>;
}
