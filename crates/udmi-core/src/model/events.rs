//! Outgoing event documents

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::entry::Entry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemEvents {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub event_count: u64,
    #[serde(default)]
    pub logentries: Vec<Entry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointsetEvents {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub points: BTreeMap<String, PointPointsetEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointPointsetEvent {
    pub present_value: serde_json::Value,
}

/// One discovered device, reported for a scan generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryEvents {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub generation: DateTime<Utc>,
    pub scan_family: String,
    pub scan_addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub refs: BTreeMap<String, serde_json::Value>,
}

/// Error report delivered on the gateway-scoped `errors` topic
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}
