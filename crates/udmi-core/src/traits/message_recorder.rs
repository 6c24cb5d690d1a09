//! Mirror of every document the device receives or sends
//!
//! Recording is for offline inspection only. The engine logs recorder
//! failures and carries on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Which way a recorded document travelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[async_trait]
pub trait MessageRecorder: Send + Sync {
    /// Record one document exchanged on `topic` by `device_id`
    async fn record(
        &self,
        device_id: &str,
        direction: Direction,
        topic: &str,
        document: &serde_json::Value,
    ) -> Result<(), crate::Error>;
}
