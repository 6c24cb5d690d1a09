// # Scan Provider Implementations

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::model::ScanDepth;
use crate::traits::{DiscoveredDevice, ScanProvider};
use crate::Error;

/// Scan provider returning a fixed device list
///
/// Used by simulated devices and tests; every scan reports the same devices.
#[derive(Debug, Clone)]
pub struct StaticScanProvider {
    devices: Vec<DiscoveredDevice>,
    scan_count: Arc<AtomicUsize>,
}

impl StaticScanProvider {
    pub fn new(devices: Vec<DiscoveredDevice>) -> Self {
        Self {
            devices,
            scan_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of scans performed so far
    pub fn scan_count(&self) -> usize {
        self.scan_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScanProvider for StaticScanProvider {
    async fn scan(
        &self,
        family: &str,
        _depth: Option<ScanDepth>,
    ) -> Result<Vec<DiscoveredDevice>, Error> {
        self.scan_count.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Static scan of {} found {} devices", family, self.devices.len());
        Ok(self.devices.clone())
    }

    fn provider_name(&self) -> &'static str {
        "static"
    }
}
