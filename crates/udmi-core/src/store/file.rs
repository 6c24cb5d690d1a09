// # File Persistent Store
//
// File-based implementation of PersistentStore with crash recovery.
//
// ## Crash Recovery
//
// - Atomic writes: Uses write-then-rename for atomicity
// - Corruption detection: Validates JSON on load
// - Automatic backup: Keeps .backup of last known good data
// - Recovery: Falls back to backup if corruption detected
//
// ## File Format
//
// ```json
// {
//   "version": "1.0",
//   "data": {
//     "endpoint": { "protocol": "mqtt", "hostname": "mqtt.example.com" },
//     "restart_count": 4,
//     "last_start": "2025-01-09T12:00:00Z"
//   }
// }
// ```

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::Error;
use crate::traits::persistent_store::{PersistentData, PersistentStore};

/// Persistent file format version
const STORE_FILE_VERSION: &str = "1.0";

/// File-based persistent store with crash recovery
///
/// # Example
///
/// ```rust,no_run
/// use udmi_core::store::FilePersistentStore;
/// use udmi_core::traits::PersistentStore;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = FilePersistentStore::new("/var/lib/udmi/AHU-1.json").await?;
///
///     let mut data = store.load().await?;
///     data.restart_count += 1;
///     store.save(&data).await?; // atomically written to disk
///
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct FilePersistentStore {
    path: PathBuf,
    state: Arc<RwLock<FileState>>,
}

#[derive(Debug)]
struct FileState {
    data: PersistentData,
    dirty: bool,
}

/// Serializable file format
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct StoreFileFormat {
    version: String,
    data: PersistentData,
}

impl FilePersistentStore {
    /// Create or load a file store
    ///
    /// This will:
    /// 1. Try to load the existing file
    /// 2. If corruption detected, try to load from backup
    /// 3. If both fail, start with defaults
    /// 4. Create parent directories if needed
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    Error::config(format!(
                        "Failed to create store directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let data = Self::load_with_recovery(&path).await?;

        Ok(Self {
            path,
            state: Arc::new(RwLock::new(FileState { data, dirty: false })),
        })
    }

    /// Load data from file with automatic recovery
    ///
    /// A file that cannot be parsed is treated as corrupt: the backup is
    /// tried next, then defaults. Read errors other than corruption are
    /// returned.
    async fn load_with_recovery(path: &Path) -> Result<PersistentData, Error> {
        let content = match Self::read(path).await? {
            Some(content) => content,
            None => {
                tracing::debug!("Store file does not exist: {}", path.display());
                return Ok(PersistentData::default());
            }
        };

        match Self::parse(path, &content) {
            Ok(data) => {
                tracing::debug!("Loaded persistent data from {}", path.display());
                Ok(data)
            }
            Err(e) => {
                tracing::warn!(
                    "Store file appears corrupted: {}. Attempting recovery from backup.",
                    e
                );

                let backup_path = Self::backup_path(path);
                let backup = match Self::read(&backup_path).await {
                    Ok(Some(backup)) => backup,
                    _ => {
                        tracing::warn!("No usable backup file found. Starting with defaults.");
                        return Ok(PersistentData::default());
                    }
                };

                match Self::parse(&backup_path, &backup) {
                    Ok(data) => {
                        tracing::info!("Recovered persistent data from backup");
                        if let Err(restore_err) = fs::copy(&backup_path, path).await {
                            tracing::error!(
                                "Failed to restore store file from backup: {}",
                                restore_err
                            );
                        }
                        Ok(data)
                    }
                    Err(backup_err) => {
                        tracing::error!(
                            "Backup also corrupted: {}. Starting with defaults.",
                            backup_err
                        );
                        Ok(PersistentData::default())
                    }
                }
            }
        }
    }

    async fn read(path: &Path) -> Result<Option<String>, Error> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path).await.map_err(|e| {
            Error::store(format!("Failed to read store file {}: {}", path.display(), e))
        })?;
        Ok(Some(content))
    }

    fn parse(path: &Path, content: &str) -> Result<PersistentData, Error> {
        let file: StoreFileFormat = serde_json::from_str(content).map_err(|e| {
            Error::store(format!("Failed to parse store file {}: {}", path.display(), e))
        })?;

        if file.version != STORE_FILE_VERSION {
            tracing::warn!(
                "Store file version mismatch: expected {}, got {}. Attempting to load anyway.",
                STORE_FILE_VERSION,
                file.version
            );
        }

        Ok(file.data)
    }

    /// Write data to file atomically
    async fn write(&self) -> Result<(), Error> {
        let mut state_guard = self.state.write().await;

        let file = StoreFileFormat {
            version: STORE_FILE_VERSION.to_string(),
            data: state_guard.data.clone(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| Error::store(format!("Failed to serialize store: {}", e)))?;

        // Write to temporary file first
        let temp_path = self.temp_path();
        {
            let mut out = fs::File::create(&temp_path).await.map_err(|e| {
                Error::store(format!(
                    "Failed to create temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            out.write_all(json.as_bytes()).await.map_err(|e| {
                Error::store(format!(
                    "Failed to write temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            out.flush().await.map_err(|e| {
                Error::store(format!(
                    "Failed to flush temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
        }

        // Keep the previous good file as backup
        if self.path.exists() {
            if let Err(e) = fs::copy(&self.path, Self::backup_path(&self.path)).await {
                tracing::warn!("Failed to create backup: {}", e);
            }
        }

        fs::rename(&temp_path, &self.path).await.map_err(|e| {
            Error::store(format!(
                "Failed to rename {} to {}: {}",
                temp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        state_guard.dirty = false;
        tracing::trace!("Persistent data written to {}", self.path.display());
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone();
        temp.set_extension("tmp");
        temp
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut backup = path.to_path_buf();
        backup.set_extension("backup");
        backup
    }
}

#[async_trait]
impl PersistentStore for FilePersistentStore {
    async fn load(&self) -> Result<PersistentData, Error> {
        Ok(self.state.read().await.data.clone())
    }

    async fn save(&self, data: &PersistentData) -> Result<(), Error> {
        {
            let mut state_guard = self.state.write().await;
            state_guard.data = data.clone();
            state_guard.dirty = true;
        }

        // Immediate write for durability
        self.write().await
    }

    async fn flush(&self) -> Result<(), Error> {
        let dirty = self.state.read().await.dirty;
        if dirty { self.write().await } else { Ok(()) }
    }
}
