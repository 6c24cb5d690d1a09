// # Message Recorder Implementations
//
// - `NullRecorder`: recording disabled
// - `MemoryRecorder`: keeps every record in memory (tests, embedding)
// - `FileRecorder`: appends JSON lines to `<dir>/<device_id>.jsonl`

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::config::RecordingConfig;
use crate::error::{Error, Result};
use crate::traits::{Direction, MessageRecorder};

/// One recorded document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedMessage {
    pub device_id: String,
    pub direction: Direction,
    pub topic: String,
    pub recorded_at: DateTime<Utc>,
    pub document: serde_json::Value,
}

impl RecordedMessage {
    fn new(device_id: &str, direction: Direction, topic: &str, document: &serde_json::Value) -> Self {
        Self {
            device_id: device_id.to_string(),
            direction,
            topic: topic.to_string(),
            recorded_at: Utc::now(),
            document: document.clone(),
        }
    }
}

/// Recorder that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullRecorder;

#[async_trait]
impl MessageRecorder for NullRecorder {
    async fn record(
        &self,
        _device_id: &str,
        _direction: Direction,
        _topic: &str,
        _document: &serde_json::Value,
    ) -> Result<()> {
        Ok(())
    }
}

/// Recorder keeping every record in memory; clones share the records
#[derive(Debug, Clone, Default)]
pub struct MemoryRecorder {
    records: Arc<Mutex<Vec<RecordedMessage>>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<RecordedMessage> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Records for one device and direction, in order
    pub fn records_for(&self, device_id: &str, direction: Direction) -> Vec<RecordedMessage> {
        self.records()
            .into_iter()
            .filter(|r| r.device_id == device_id && r.direction == direction)
            .collect()
    }
}

#[async_trait]
impl MessageRecorder for MemoryRecorder {
    async fn record(
        &self,
        device_id: &str,
        direction: Direction,
        topic: &str,
        document: &serde_json::Value,
    ) -> Result<()> {
        let record = RecordedMessage::new(device_id, direction, topic, document);
        self.records.lock().unwrap_or_else(|e| e.into_inner()).push(record);
        Ok(())
    }
}

/// Recorder appending JSON lines, one file per device
#[derive(Debug, Clone)]
pub struct FileRecorder {
    dir: PathBuf,
}

impl FileRecorder {
    /// Create the recorder, creating `dir` if needed
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await.map_err(|e| {
            Error::config(format!(
                "Failed to create record directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(Self { dir })
    }

    /// Path of the record file for a device
    pub fn path_for(&self, device_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", device_id))
    }
}

#[async_trait]
impl MessageRecorder for FileRecorder {
    async fn record(
        &self,
        device_id: &str,
        direction: Direction,
        topic: &str,
        document: &serde_json::Value,
    ) -> Result<()> {
        let record = RecordedMessage::new(device_id, direction, topic, document);
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let path = self.path_for(device_id);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Error::store(format!("Failed to open {}: {}", path.display(), e)))?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Open the recorder described by the device configuration
pub async fn open(config: &RecordingConfig) -> Result<Arc<dyn MessageRecorder>> {
    match config {
        RecordingConfig::Disabled => Ok(Arc::new(NullRecorder)),
        RecordingConfig::File { dir } => Ok(Arc::new(FileRecorder::new(dir).await?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_memory_recorder_filters() {
        let recorder = MemoryRecorder::new();
        recorder
            .record("AHU-1", Direction::Inbound, "config", &json!({ "system": {} }))
            .await
            .unwrap();
        recorder
            .record("AHU-1", Direction::Outbound, "state", &json!({ "system": {} }))
            .await
            .unwrap();

        let outbound = recorder.records_for("AHU-1", Direction::Outbound);
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].topic, "state");
    }

    #[tokio::test]
    async fn test_file_recorder_appends_lines() {
        let dir = tempdir().unwrap();
        let recorder = FileRecorder::new(dir.path().join("out")).await.unwrap();

        for n in 0..3 {
            recorder
                .record("GAT-1", Direction::Outbound, "events/system", &json!({ "n": n }))
                .await
                .unwrap();
        }

        let content = fs::read_to_string(recorder.path_for("GAT-1")).await.unwrap();
        let lines: Vec<RecordedMessage> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2].document["n"], 2);
        assert_eq!(lines[0].direction, Direction::Outbound);
    }
}
