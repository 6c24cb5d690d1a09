//! Plugin-based provider registry
//!
//! The registry allows transports and discovery scanners to be registered
//! dynamically at runtime, avoiding hardcoded if-else chains.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use udmi_core::registry::ProviderRegistry;
//!
//! let registry = ProviderRegistry::new();
//!
//! // Transports are keyed by endpoint protocol
//! registry.register_transport("memory", Box::new(memory_factory));
//!
//! // Scanners are keyed by address family
//! registry.register_scan_provider("vendor", Arc::new(vendor_scanner));
//!
//! let transport = registry.create_transport("AHU-1", &endpoint)?;
//! ```
//!
//! ## Registration
//!
//! Plug-in crates should register themselves during initialization:
//!
//! ```rust,ignore
//! // In udmi-transport-spool crate
//! pub fn register(registry: &ProviderRegistry) {
//!     registry.register_transport("spool", Box::new(SpoolTransportFactory));
//! }
//! ```

use crate::error::{Error, Result};
use crate::model::EndpointConfiguration;
use crate::traits::{ScanProvider, Transport, TransportFactory};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Registry mapping endpoint protocols to transport factories and
/// address families to scan providers
///
/// ## Thread Safety
///
/// The registry uses interior mutability with RwLock, allowing concurrent
/// reads and exclusive writes.
#[derive(Default)]
pub struct ProviderRegistry {
    /// Registered transport factories, by protocol
    transports: RwLock<HashMap<String, Box<dyn TransportFactory>>>,

    /// Registered scan providers, by address family
    scanners: RwLock<HashMap<String, Arc<dyn ScanProvider>>>,
}

impl ProviderRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport factory for an endpoint protocol
    ///
    /// Registering the same protocol twice replaces the earlier factory.
    pub fn register_transport(
        &self,
        protocol: impl Into<String>,
        factory: Box<dyn TransportFactory>,
    ) {
        let protocol = protocol.into();
        let mut transports = self.transports.write().unwrap_or_else(|e| e.into_inner());
        transports.insert(protocol, factory);
    }

    /// Register the scan provider for an address family
    pub fn register_scan_provider(&self, family: impl Into<String>, provider: Arc<dyn ScanProvider>) {
        let family = family.into();
        let mut scanners = self.scanners.write().unwrap_or_else(|e| e.into_inner());
        scanners.insert(family, provider);
    }

    /// Create a transport for `device_id` targeting `endpoint`
    ///
    /// # Returns
    ///
    /// - `Ok(Box<dyn Transport>)`: Created (unconnected) transport
    /// - `Err(Error)`: If the protocol is not registered or creation fails
    pub fn create_transport(
        &self,
        device_id: &str,
        endpoint: &EndpointConfiguration,
    ) -> Result<Box<dyn Transport>> {
        let transports = self.transports.read().unwrap_or_else(|e| e.into_inner());

        let factory = transports.get(&endpoint.protocol).ok_or_else(|| {
            Error::config(format!("Unknown transport protocol: {}", endpoint.protocol))
        })?;

        factory.create(device_id, endpoint)
    }

    /// Scan provider for an address family, if one is registered
    pub fn scan_provider(&self, family: &str) -> Option<Arc<dyn ScanProvider>> {
        let scanners = self.scanners.read().unwrap_or_else(|e| e.into_inner());
        scanners.get(family).cloned()
    }

    /// List all registered transport protocols
    pub fn list_transports(&self) -> Vec<String> {
        let transports = self.transports.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = transports.keys().cloned().collect();
        names.sort();
        names
    }

    /// List all address families with a scan provider
    pub fn list_scan_families(&self) -> Vec<String> {
        let scanners = self.scanners.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = scanners.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a transport protocol is registered
    pub fn has_transport(&self, protocol: &str) -> bool {
        let transports = self.transports.read().unwrap_or_else(|e| e.into_inner());
        transports.contains_key(protocol)
    }
}
