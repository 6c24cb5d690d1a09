//! Config document pushed by the controller
//!
//! The device never mutates a received config; it keeps a mirror of the
//! last one and hands each sub-block to the component that owns it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::state::{BlobPhase, SystemMode};

/// Name of the blob carrying an endpoint descriptor
pub const IOT_ENDPOINT_CONFIG: &str = "iot_endpoint_config";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_base: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discovery: Option<DiscoveryConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pointset: Option<PointsetConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blobset: Option<BlobsetConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub localnet: Option<LocalnetConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Minimum level of entries included in outgoing system events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_loglevel: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_rate_sec: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<OperationConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<SystemMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_start: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub proxy_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub families: BTreeMap<String, FamilyDiscoveryConfig>,
}

/// Per-family discovery request
///
/// No generation together with a zero interval means "no scan".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FamilyDiscoveryConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_interval_sec: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<ScanDepth>,
}

/// How much detail a scan should collect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanDepth {
    Buckets,
    System,
    Entries,
    Details,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PointsetConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate_sec: Option<u32>,
    pub points: BTreeMap<String, PointPointsetConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PointPointsetConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set_value: Option<serde_json::Value>,
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub point_ref: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobsetConfig {
    pub blobs: BTreeMap<String, BlobBlobsetConfig>,
}

/// A named blob; the payload is a `data:` URL with a SHA-256 content hash
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobBlobsetConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<BlobPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalnetConfig {
    pub families: BTreeMap<String, FamilyLocalnetConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FamilyLocalnetConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
}
