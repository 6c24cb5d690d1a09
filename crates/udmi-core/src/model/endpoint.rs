//! Transport endpoint descriptor

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Where and how the device connects to its transport
///
/// The canonical JSON serialization of a descriptor is its "signature",
/// used to tell whether a redirect target is already applied or was
/// already attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfiguration {
    /// Transport protocol, used to pick a registered transport factory
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// Broker host name (or spool directory for the spool transport)
    #[serde(default)]
    pub hostname: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_prefix: Option<String>,

    /// Opaque token identifying the instruction that produced this descriptor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<String>,

    /// Controller-described failure; a descriptor carrying one is never applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_protocol() -> String {
    "mqtt".to_string()
}

impl EndpointConfiguration {
    /// Create a descriptor for the given protocol and host
    pub fn new(protocol: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            hostname: hostname.into(),
            port: None,
            client_id: None,
            topic_prefix: None,
            generation: None,
            error: None,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Canonical serialization
    pub fn signature(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Copy of this descriptor with the registry segment of the client id replaced
    ///
    /// Client ids look like
    /// `projects/<p>/locations/<l>/registries/<r>/devices/<d>`. Ids without a
    /// registry segment get the registry name as a prefix.
    pub fn redirected_to_registry(&self, registry: &str) -> Self {
        let mut endpoint = self.clone();
        let client_id = self.client_id.clone().unwrap_or_default();
        let mut parts: Vec<String> = client_id.split('/').map(str::to_string).collect();
        match parts.iter().position(|part| part == "registries") {
            Some(index) if index + 1 < parts.len() => {
                parts[index + 1] = registry.to_string();
                endpoint.client_id = Some(parts.join("/"));
            }
            _ => {
                endpoint.client_id = Some(format!("registries/{}/{}", registry, client_id));
            }
        }
        endpoint
    }

    /// Validate the descriptor
    pub fn validate(&self) -> Result<()> {
        if self.protocol.is_empty() {
            return Err(Error::config("Endpoint protocol cannot be empty"));
        }
        if self.hostname.is_empty() {
            return Err(Error::config("Endpoint hostname cannot be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_is_stable() {
        let endpoint = EndpointConfiguration::new("memory", "broker-a").with_port(8883);
        let signature = endpoint.signature().unwrap();
        assert_eq!(signature, endpoint.clone().signature().unwrap());
        assert_ne!(signature, endpoint.with_client_id("AHU-1").signature().unwrap());
    }

    #[test]
    fn test_redirect_registry_rewrites_segment() {
        let endpoint = EndpointConfiguration::new("mqtt", "mqtt.example.com").with_client_id(
            "projects/p1/locations/us-central1/registries/ZZ-TRI-FECTA/devices/AHU-1",
        );
        let redirected = endpoint.redirected_to_registry("ZZ-REDIRECT-NA");
        assert_eq!(
            redirected.client_id.as_deref(),
            Some("projects/p1/locations/us-central1/registries/ZZ-REDIRECT-NA/devices/AHU-1")
        );
        assert_ne!(redirected.signature().unwrap(), endpoint.signature().unwrap());
    }
}
