//! Log entries and severity levels
//!
//! Entries are the single funnel for component-level failures and
//! operational notices. They are buffered by the system component and
//! flushed into outgoing `events/system` messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Well-known entry categories
pub mod category {
    pub const SYSTEM_CONFIG_PARSE: &str = "system.config.parse";
    pub const SYSTEM_BASE_START: &str = "system.base.start";
    pub const SYSTEM_BASE_SHUTDOWN: &str = "system.base.shutdown";
    pub const BLOBSET_BLOB_RECEIVE: &str = "blobset.blob.receive";
    pub const BLOBSET_BLOB_APPLY: &str = "blobset.blob.apply";
    pub const DISCOVERY_FAMILY_CONFIG: &str = "discovery.family.config";
    pub const DISCOVERY_FAMILY_SCAN: &str = "discovery.family.scan";
    pub const GATEWAY_PROXY_ATTACH: &str = "gateway.proxy.attach";
    pub const GATEWAY_PROXY_ERROR: &str = "gateway.proxy.error";
    pub const POINTSET_POINT_INVALID: &str = "pointset.point.invalid";
}

/// Ordered entry severity
///
/// Serialized as the protocol's integer value (100 = TRACE … 900 = EMERGENCY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u16", from = "u16")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

impl Level {
    /// Protocol integer value
    pub fn value(self) -> u16 {
        match self {
            Level::Trace => 100,
            Level::Debug => 200,
            Level::Info => 300,
            Level::Notice => 400,
            Level::Warning => 500,
            Level::Error => 600,
            Level::Critical => 700,
            Level::Alert => 800,
            Level::Emergency => 900,
        }
    }

    /// Map an integer value onto the closest level at or below it
    pub fn from_value(value: u16) -> Self {
        match value {
            0..=199 => Level::Trace,
            200..=299 => Level::Debug,
            300..=399 => Level::Info,
            400..=499 => Level::Notice,
            500..=599 => Level::Warning,
            600..=699 => Level::Error,
            700..=799 => Level::Critical,
            800..=899 => Level::Alert,
            _ => Level::Emergency,
        }
    }
}

impl From<Level> for u16 {
    fn from(level: Level) -> Self {
        level.value()
    }
}

impl From<u16> for Level {
    fn from(value: u16) -> Self {
        Level::from_value(value)
    }
}

/// A single log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub category: String,
    pub timestamp: DateTime<Utc>,
    pub level: Level,
}

impl Entry {
    /// Create an entry stamped with the current time
    pub fn new(level: Level, category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
            category: category.into(),
            timestamp: Utc::now(),
            level,
        }
    }

    /// Attach a detail string
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Build an error-status entry from an engine error
    pub fn from_error(category: impl Into<String>, err: &Error) -> Self {
        Self::new(Level::Error, category, err.to_string()).with_detail(format!("{:?}", err))
    }

    /// Write the entry to the local tracing output
    pub fn trace_local(&self, device_id: &str) {
        match self.level {
            Level::Trace => tracing::trace!(device = device_id, category = %self.category, "{}", self.message),
            Level::Debug => tracing::debug!(device = device_id, category = %self.category, "{}", self.message),
            Level::Info | Level::Notice => {
                tracing::info!(device = device_id, category = %self.category, "{}", self.message)
            }
            Level::Warning => tracing::warn!(device = device_id, category = %self.category, "{}", self.message),
            _ => tracing::error!(device = device_id, category = %self.category, "{}", self.message),
        }
    }
}
