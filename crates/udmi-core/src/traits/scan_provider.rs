// # Scan Provider Trait
//
// Performs the actual network discovery for one address family. The
// engine decides when scans run; providers only report what they find.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::ScanDepth;

/// A device found by a discovery scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Address of the device within the scanned family
    pub addr: String,
    #[serde(default)]
    pub network: Option<String>,
    /// Points or properties found on the device
    #[serde(default)]
    pub refs: BTreeMap<String, serde_json::Value>,
}

impl DiscoveredDevice {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            network: None,
            refs: BTreeMap::new(),
        }
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    pub fn with_ref(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.refs.insert(name.into(), value);
        self
    }
}

/// Trait for discovery scan implementations
///
/// `scan` is invoked once per generation and is bounded by the engine's
/// scan duration. Providers must not schedule their own rescans.
#[async_trait]
pub trait ScanProvider: Send + Sync {
    /// Scan `family`, returning every device found
    async fn scan(
        &self,
        family: &str,
        depth: Option<ScanDepth>,
    ) -> Result<Vec<DiscoveredDevice>, crate::Error>;

    /// Provider name (for logging)
    fn provider_name(&self) -> &'static str;
}
