//! State document computed locally and published by the device

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::entry::Entry;

/// Device operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemMode {
    Initial,
    Active,
    Updating,
    Restart,
    Shutdown,
    Terminate,
}

/// Exit code used for modes without a defined mapping
pub const UNKNOWN_MODE_EXIT_CODE: i32 = -1;

impl SystemMode {
    /// Process exit code for this mode, the contract with the supervisor
    pub fn exit_code(self) -> i32 {
        match self {
            SystemMode::Shutdown => 0,
            SystemMode::Restart => 192,
            SystemMode::Terminate => 193,
            _ => UNKNOWN_MODE_EXIT_CODE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobPhase {
    Apply,
    Final,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryPhase {
    Pending,
    Active,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueState {
    Applied,
    Invalid,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub system: SystemState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery: Option<DiscoveryState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pointset: Option<PointsetState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blobset: Option<BlobsetState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub localnet: Option<LocalnetState>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_config: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_no: Option<String>,
    #[serde(default)]
    pub hardware: HardwareState,
    #[serde(default)]
    pub software: BTreeMap<String, String>,
    #[serde(default)]
    pub operation: OperationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Entry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub make: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationState {
    pub operational: bool,
    pub mode: SystemMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub restart_count: u32,
}

impl Default for OperationState {
    fn default() -> Self {
        Self {
            operational: true,
            mode: SystemMode::Initial,
            last_start: None,
            restart_count: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Entry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryState {
    #[serde(default)]
    pub families: BTreeMap<String, FamilyDiscoveryState>,
}

/// Per-family discovery status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyDiscoveryState {
    pub phase: DiscoveryPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Entry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointsetState {
    #[serde(default)]
    pub points: BTreeMap<String, PointPointsetState>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointPointsetState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_state: Option<ValueState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Entry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlobsetState {
    #[serde(default)]
    pub blobs: BTreeMap<String, BlobBlobsetState>,
}

/// Outcome of the last attempt to apply a blob
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlobBlobsetState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<BlobPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Entry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalnetState {
    #[serde(default)]
    pub families: BTreeMap<String, FamilyLocalnetState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyLocalnetState {
    pub addr: String,
}
