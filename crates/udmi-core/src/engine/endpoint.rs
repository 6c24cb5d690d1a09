//! Endpoint failover controller
//!
//! Tracks the endpoint the device is connected to, extracts redirect
//! instructions from the `iot_endpoint_config` blob and decides whether a
//! redirect should be attempted. The connection swap itself and the
//! rollback are driven by the device runtime.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::model::config::{BlobBlobsetConfig, Config, IOT_ENDPOINT_CONFIG};
use crate::model::endpoint::EndpointConfiguration;
use crate::model::entry::{Entry, Level, category};
use crate::model::state::{BlobBlobsetState, BlobPhase, BlobsetState};

/// Prefix of an inline JSON blob payload
pub const DATA_URL_PREFIX: &str = "data:application/json;base64,";

/// Lowercase hex SHA-256 of a byte string
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Encode an endpoint descriptor as a FINAL `iot_endpoint_config` blob
pub fn endpoint_blob(
    endpoint: &EndpointConfiguration,
    generation: Option<&str>,
) -> Result<BlobBlobsetConfig> {
    let bytes = serde_json::to_vec(endpoint)?;
    Ok(BlobBlobsetConfig {
        phase: Some(BlobPhase::Final),
        url: Some(format!("{}{}", DATA_URL_PREFIX, STANDARD.encode(&bytes))),
        sha256: Some(sha256_hex(&bytes)),
        generation: generation.map(str::to_string),
    })
}

/// Decode and verify the endpoint descriptor carried in a config
///
/// Only a FINAL `iot_endpoint_config` blob carries a descriptor; absence
/// or any other phase yields `Ok(None)`. A malformed payload or a hash
/// mismatch is `Error::BlobCorrupt`.
pub fn extract_endpoint_blob(config: &Config) -> Result<Option<EndpointConfiguration>> {
    let Some(blob) = config
        .blobset
        .as_ref()
        .and_then(|blobset| blobset.blobs.get(IOT_ENDPOINT_CONFIG))
    else {
        return Ok(None);
    };
    if blob.phase != Some(BlobPhase::Final) {
        return Ok(None);
    }

    let corrupt = |reason: String| Error::blob_corrupt(IOT_ENDPOINT_CONFIG, reason);

    let url = blob
        .url
        .as_deref()
        .ok_or_else(|| corrupt("missing url".to_string()))?;
    let encoded = url
        .strip_prefix(DATA_URL_PREFIX)
        .ok_or_else(|| corrupt(format!("unsupported url scheme, expected {}", DATA_URL_PREFIX)))?;
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| corrupt(format!("bad base64 payload: {}", e)))?;

    let expected = blob
        .sha256
        .as_deref()
        .ok_or_else(|| corrupt("missing sha256".to_string()))?;
    let actual = sha256_hex(&bytes);
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(corrupt(format!(
            "sha256 mismatch: declared {}, computed {}",
            expected, actual
        )));
    }

    let mut endpoint: EndpointConfiguration = serde_json::from_slice(&bytes)
        .map_err(|e| corrupt(format!("bad endpoint document: {}", e)))?;
    if endpoint.generation.is_none() {
        endpoint.generation = blob.generation.clone();
    }
    Ok(Some(endpoint))
}

/// What the runtime should do after a config was applied
#[derive(Debug, Clone, PartialEq)]
pub enum RedirectPlan {
    /// Nothing to do
    Noop,
    /// The redirect instruction went away; blob state was removed
    Cleared,
    /// The descriptor carried an error; blob is FINAL with that error
    Rejected(Entry),
    /// Blob is in APPLY; connect to this endpoint
    Attempt(EndpointConfiguration),
}

#[derive(Debug, Clone, PartialEq)]
enum Extraction {
    Absent,
    Descriptor(EndpointConfiguration),
    Corrupt,
}

pub struct EndpointFailover {
    working: EndpointConfiguration,
    redirect_registry: Option<String>,
    extraction: Extraction,
    /// Signature of the last redirect target tried and not applied
    attempted: Option<String>,
}

impl EndpointFailover {
    pub fn new(working: EndpointConfiguration, redirect_registry: Option<String>) -> Self {
        Self {
            working,
            redirect_registry,
            extraction: Extraction::Absent,
            attempted: None,
        }
    }

    /// Endpoint of the live connection
    pub fn working_endpoint(&self) -> &EndpointConfiguration {
        &self.working
    }

    pub fn set_working(&mut self, endpoint: EndpointConfiguration) {
        self.working = endpoint;
    }

    pub fn attempted_signature(&self) -> Option<&str> {
        self.attempted.as_deref()
    }

    /// Pick up the endpoint blob of a freshly received config
    ///
    /// A corrupt blob is reported as FINAL with an error status and the
    /// returned entry; no redirect is planned for it.
    pub fn update_config(
        &mut self,
        config: &Config,
        blobset: &mut Option<BlobsetState>,
    ) -> Option<Entry> {
        match extract_endpoint_blob(config) {
            Ok(Some(endpoint)) => {
                self.extraction = Extraction::Descriptor(endpoint);
                None
            }
            Ok(None) => {
                self.extraction = Extraction::Absent;
                None
            }
            Err(e) => {
                self.extraction = Extraction::Corrupt;
                let entry = Entry::from_error(category::BLOBSET_BLOB_RECEIVE, &e);
                let generation = config
                    .blobset
                    .as_ref()
                    .and_then(|b| b.blobs.get(IOT_ENDPOINT_CONFIG))
                    .and_then(|b| b.generation.clone());
                let blob = blob_state(blobset);
                blob.phase = Some(BlobPhase::Final);
                blob.generation = generation;
                blob.status = Some(entry.clone());
                Some(entry)
            }
        }
    }

    /// Decide whether to redirect, updating the blob state accordingly
    pub fn plan_redirect(&mut self, blobset: &mut Option<BlobsetState>) -> Result<RedirectPlan> {
        let target = match (&self.redirect_registry, &self.extraction) {
            (_, Extraction::Corrupt) => return Ok(RedirectPlan::Noop),
            (Some(registry), _) => Some(self.working.redirected_to_registry(registry)),
            (None, Extraction::Descriptor(endpoint)) => Some(endpoint.clone()),
            (None, Extraction::Absent) => None,
        };

        let Some(target) = target else {
            let had_attempt = self.attempted.take().is_some();
            let removed = remove_blob_state(blobset);
            return Ok(if had_attempt || removed {
                RedirectPlan::Cleared
            } else {
                RedirectPlan::Noop
            });
        };

        let signature = target.signature()?;
        if signature == self.working.signature()? || self.attempted.as_deref() == Some(&signature)
        {
            return Ok(RedirectPlan::Noop);
        }

        let blob = blob_state(blobset);
        if target.generation.is_some() && target.generation != blob.generation {
            blob.phase = None;
            blob.status = None;
            blob.generation = target.generation.clone();
        }
        self.attempted = Some(signature);

        if let Some(error) = &target.error {
            let entry = Entry::new(
                Level::Error,
                category::BLOBSET_BLOB_APPLY,
                format!("Endpoint redirect refused: {}", error),
            );
            blob.phase = Some(BlobPhase::Final);
            blob.status = Some(entry.clone());
            return Ok(RedirectPlan::Rejected(entry));
        }

        blob.phase = Some(BlobPhase::Apply);
        Ok(RedirectPlan::Attempt(target))
    }

    /// The redirect target connected; it becomes the working endpoint
    pub fn redirect_succeeded(
        &mut self,
        endpoint: EndpointConfiguration,
        blobset: &mut Option<BlobsetState>,
    ) {
        let blob = blob_state(blobset);
        blob.phase = Some(BlobPhase::Final);
        blob.status = None;
        self.working = endpoint;
        self.attempted = None;
    }

    /// The redirect target failed; the attempt stays recorded so the same
    /// target is not tried again
    pub fn redirect_failed(&mut self, err: &Error, blobset: &mut Option<BlobsetState>) -> Entry {
        let entry = Entry::from_error(category::BLOBSET_BLOB_APPLY, err);
        let blob = blob_state(blobset);
        blob.phase = Some(BlobPhase::Final);
        blob.status = Some(entry.clone());
        entry
    }
}

fn blob_state(blobset: &mut Option<BlobsetState>) -> &mut BlobBlobsetState {
    blobset
        .get_or_insert_with(BlobsetState::default)
        .blobs
        .entry(IOT_ENDPOINT_CONFIG.to_string())
        .or_default()
}

fn remove_blob_state(blobset: &mut Option<BlobsetState>) -> bool {
    let Some(state) = blobset.as_mut() else {
        return false;
    };
    let removed = state.blobs.remove(IOT_ENDPOINT_CONFIG).is_some();
    if state.blobs.is_empty() {
        *blobset = None;
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::BlobsetConfig;
    use std::collections::BTreeMap;

    fn config_with(blob: BlobBlobsetConfig) -> Config {
        Config {
            blobset: Some(BlobsetConfig {
                blobs: BTreeMap::from([(IOT_ENDPOINT_CONFIG.to_string(), blob)]),
            }),
            ..Config::default()
        }
    }

    fn endpoint_a() -> EndpointConfiguration {
        EndpointConfiguration::new("memory", "broker-a")
    }

    fn endpoint_b() -> EndpointConfiguration {
        EndpointConfiguration::new("memory", "broker-b")
    }

    #[test]
    fn test_extract_verified_descriptor() {
        let config = config_with(endpoint_blob(&endpoint_b(), Some("g1")).unwrap());
        let extracted = extract_endpoint_blob(&config).unwrap().unwrap();
        assert_eq!(extracted.hostname, "broker-b");
        assert_eq!(extracted.generation.as_deref(), Some("g1"));
    }

    #[test]
    fn test_extract_ignores_non_final_blob() {
        let mut blob = endpoint_blob(&endpoint_b(), None).unwrap();
        blob.phase = Some(BlobPhase::Apply);
        assert!(extract_endpoint_blob(&config_with(blob)).unwrap().is_none());
        assert!(extract_endpoint_blob(&Config::default()).unwrap().is_none());
    }

    #[test]
    fn test_extract_rejects_hash_mismatch() {
        let mut blob = endpoint_blob(&endpoint_b(), None).unwrap();
        blob.sha256 = Some(sha256_hex(b"something else"));
        let err = extract_endpoint_blob(&config_with(blob)).unwrap_err();
        assert!(matches!(err, Error::BlobCorrupt { .. }));
    }

    #[test]
    fn test_extract_rejects_bad_scheme() {
        let mut blob = endpoint_blob(&endpoint_b(), None).unwrap();
        blob.url = Some("https://example.com/endpoint.json".to_string());
        assert!(extract_endpoint_blob(&config_with(blob)).is_err());
    }

    #[test]
    fn test_corrupt_blob_reported_without_redirect() {
        let mut failover = EndpointFailover::new(endpoint_a(), None);
        let mut blob = endpoint_blob(&endpoint_b(), Some("g1")).unwrap();
        blob.sha256 = Some("00".repeat(32));
        let mut blobset = None;

        let entry = failover.update_config(&config_with(blob), &mut blobset).unwrap();
        assert_eq!(entry.category, category::BLOBSET_BLOB_RECEIVE);
        assert_eq!(failover.plan_redirect(&mut blobset).unwrap(), RedirectPlan::Noop);

        let state = &blobset.unwrap().blobs[IOT_ENDPOINT_CONFIG];
        assert_eq!(state.phase, Some(BlobPhase::Final));
        assert!(state.status.is_some());
    }

    #[test]
    fn test_failed_target_not_retried_until_new_generation() {
        let mut failover = EndpointFailover::new(endpoint_a(), None);
        let mut blobset = None;

        let config = config_with(endpoint_blob(&endpoint_b(), Some("g1")).unwrap());
        failover.update_config(&config, &mut blobset);
        let plan = failover.plan_redirect(&mut blobset).unwrap();
        assert!(matches!(plan, RedirectPlan::Attempt(ref e) if e.hostname == "broker-b"));
        assert_eq!(
            blobset.as_ref().unwrap().blobs[IOT_ENDPOINT_CONFIG].phase,
            Some(BlobPhase::Apply)
        );

        failover.redirect_failed(&Error::transport("unreachable"), &mut blobset);
        assert_eq!(failover.working_endpoint(), &endpoint_a());

        // Same instruction again
        failover.update_config(&config, &mut blobset);
        assert_eq!(failover.plan_redirect(&mut blobset).unwrap(), RedirectPlan::Noop);

        // New generation token: status reset and a fresh attempt
        let config = config_with(endpoint_blob(&endpoint_b(), Some("g2")).unwrap());
        failover.update_config(&config, &mut blobset);
        assert!(matches!(
            failover.plan_redirect(&mut blobset).unwrap(),
            RedirectPlan::Attempt(_)
        ));
        let state = &blobset.unwrap().blobs[IOT_ENDPOINT_CONFIG];
        assert_eq!(state.generation.as_deref(), Some("g2"));
        assert!(state.status.is_none());
    }

    #[test]
    fn test_success_makes_target_working() {
        let mut failover = EndpointFailover::new(endpoint_a(), None);
        let mut blobset = None;
        let config = config_with(endpoint_blob(&endpoint_b(), Some("g1")).unwrap());

        failover.update_config(&config, &mut blobset);
        let RedirectPlan::Attempt(target) = failover.plan_redirect(&mut blobset).unwrap() else {
            panic!("expected a redirect attempt");
        };
        failover.redirect_succeeded(target, &mut blobset);
        assert_eq!(failover.working_endpoint().hostname, "broker-b");

        failover.update_config(&config, &mut blobset);
        assert_eq!(failover.plan_redirect(&mut blobset).unwrap(), RedirectPlan::Noop);
    }

    #[test]
    fn test_embedded_error_is_rejected() {
        let mut failover = EndpointFailover::new(endpoint_a(), None);
        let mut blobset = None;
        let mut target = endpoint_b();
        target.error = Some("registry not provisioned".to_string());

        failover.update_config(&config_with(endpoint_blob(&target, None).unwrap()), &mut blobset);
        let plan = failover.plan_redirect(&mut blobset).unwrap();
        assert!(matches!(plan, RedirectPlan::Rejected(_)));
        let state = &blobset.unwrap().blobs[IOT_ENDPOINT_CONFIG];
        assert_eq!(state.phase, Some(BlobPhase::Final));
        assert!(state.status.as_ref().unwrap().message.contains("registry not provisioned"));
    }

    #[test]
    fn test_removed_blob_clears_state() {
        let mut failover = EndpointFailover::new(endpoint_a(), None);
        let mut blobset = None;
        failover.update_config(
            &config_with(endpoint_blob(&endpoint_b(), None).unwrap()),
            &mut blobset,
        );
        failover.plan_redirect(&mut blobset).unwrap();
        failover.redirect_failed(&Error::transport("down"), &mut blobset);

        failover.update_config(&Config::default(), &mut blobset);
        assert_eq!(failover.plan_redirect(&mut blobset).unwrap(), RedirectPlan::Cleared);
        assert!(blobset.is_none());
        assert!(failover.attempted_signature().is_none());
        assert_eq!(failover.plan_redirect(&mut blobset).unwrap(), RedirectPlan::Noop);
    }

    #[test]
    fn test_redirect_registry_override() {
        let working = endpoint_a().with_client_id("projects/p/locations/l/registries/R1/devices/D");
        let mut failover = EndpointFailover::new(working, Some("R2".to_string()));
        let mut blobset = None;
        failover.update_config(&Config::default(), &mut blobset);

        let RedirectPlan::Attempt(target) = failover.plan_redirect(&mut blobset).unwrap() else {
            panic!("expected a redirect attempt");
        };
        assert_eq!(
            target.client_id.as_deref(),
            Some("projects/p/locations/l/registries/R2/devices/D")
        );
        failover.redirect_succeeded(target, &mut blobset);
        assert_eq!(failover.plan_redirect(&mut blobset).unwrap(), RedirectPlan::Noop);
    }
}
