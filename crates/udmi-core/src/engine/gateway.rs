//! Gateway coordinator
//!
//! Owns the proxy devices of a gateway. Membership comes from device
//! metadata and only changes while the engine starts; live gateway config
//! is passed through to state untouched.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::EngineEvent;
use super::device::{DeviceRuntime, EngineContext};
use crate::config::{DeviceConfig, DeviceOptions};
use crate::model::config::GatewayConfig;
use crate::model::state::GatewayState;
use crate::model::{Entry, GatewayError, Level, category};

/// Identity of the synthetic device added by the `extra_device` option
pub const EXTRA_PROXY_ID: &str = "XXX-1";

/// Proxy identities to instantiate for the given metadata ids
///
/// Ids are sorted; `no_proxy` skips the lexicographically-first one and
/// `extra_device` appends [`EXTRA_PROXY_ID`].
pub fn proxy_ids_for(ids: &[String], options: &DeviceOptions) -> Vec<String> {
    let mut ids = ids.to_vec();
    ids.sort();
    ids.dedup();
    if options.no_proxy && !ids.is_empty() {
        let skipped = ids.remove(0);
        info!("Not proxying {}", skipped);
    }
    if options.extra_device && !ids.iter().any(|id| id == EXTRA_PROXY_ID) {
        ids.push(EXTRA_PROXY_ID.to_string());
    }
    ids
}

/// Gateway block of the state for a received gateway config
pub fn gateway_state(config: Option<&GatewayConfig>) -> Option<GatewayState> {
    config.map(|gateway| GatewayState {
        target_family: gateway.target.as_ref().and_then(|t| t.family.clone()),
        status: None,
    })
}

/// Entry reporting an error delivered on the `errors` topic
pub fn gateway_error_entry(error: &GatewayError) -> Entry {
    let message = match (&error.error_type, &error.description) {
        (Some(kind), Some(description)) => format!("{}: {}", kind, description),
        (Some(kind), None) => kind.clone(),
        (None, Some(description)) => description.clone(),
        (None, None) => "Unspecified gateway error".to_string(),
    };
    Entry::new(Level::Error, category::GATEWAY_PROXY_ERROR, message)
}

struct ProxyDevice {
    runtime: Arc<DeviceRuntime>,
    active: bool,
}

pub struct GatewayCoordinator {
    gateway_id: String,
    proxies: BTreeMap<String, ProxyDevice>,
}

impl GatewayCoordinator {
    pub fn new(gateway_id: impl Into<String>) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            proxies: BTreeMap::new(),
        }
    }

    /// Instantiate one proxy device per id from the gateway metadata
    pub(crate) async fn create_proxy_devices(
        &mut self,
        ctx: &Arc<EngineContext>,
        config: &DeviceConfig,
    ) {
        let ids = config
            .gateway
            .as_ref()
            .map(|gateway| proxy_ids_for(&gateway.proxy_ids, &config.options))
            .unwrap_or_default();

        for id in ids {
            let proxy_config = config.for_proxy(&id);
            let runtime = DeviceRuntime::new(Arc::clone(ctx), &proxy_config, None);
            runtime
                .initialize(&proxy_config.identity, 0, &proxy_config.localnet)
                .await;
            debug!("Created proxy device {}", id);
            self.proxies.insert(
                id,
                ProxyDevice {
                    runtime,
                    active: false,
                },
            );
        }
    }

    /// Attach every proxy through the current connection and start it
    ///
    /// A proxy that fails to attach is reported on the gateway and stays
    /// inactive; its siblings are unaffected.
    pub(crate) async fn activate(&mut self, ctx: &EngineContext, gateway: &DeviceRuntime) {
        let transport = ctx.transport.current();
        for (id, proxy) in self.proxies.iter_mut() {
            match transport.attach(id).await {
                Ok(()) => {
                    ctx.mark_attached(id);
                    proxy.active = true;
                    proxy.runtime.start_worker();
                    info!("Proxy device {} activated", id);
                    ctx.emit_event(EngineEvent::ProxyActivated {
                        device_id: id.clone(),
                    });
                }
                Err(e) => {
                    warn!("Failed to attach proxy device {}: {}", id, e);
                    let entry = Entry::new(
                        Level::Error,
                        category::GATEWAY_PROXY_ATTACH,
                        format!("Proxy device {} attach failed", id),
                    )
                    .with_detail(e.to_string());
                    gateway.publish_log_message(entry).await;
                    ctx.emit_event(EngineEvent::ProxyFailed {
                        device_id: id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    /// Ids of every proxy device, sorted
    pub fn proxy_ids(&self) -> Vec<String> {
        self.proxies.keys().cloned().collect()
    }

    pub fn is_active(&self, device_id: &str) -> bool {
        self.proxies.get(device_id).is_some_and(|proxy| proxy.active)
    }

    /// Runtime of an active proxy
    pub(crate) fn route(&self, device_id: &str) -> Option<Arc<DeviceRuntime>> {
        self.proxies
            .get(device_id)
            .filter(|proxy| proxy.active)
            .map(|proxy| Arc::clone(&proxy.runtime))
    }

    /// Runtime of any proxy, active or not
    pub(crate) fn proxy(&self, device_id: &str) -> Option<Arc<DeviceRuntime>> {
        self.proxies
            .get(device_id)
            .map(|proxy| Arc::clone(&proxy.runtime))
    }

    /// Route an entry to the gateway itself or to the named proxy
    ///
    /// Returns false when `target_id` names no known device.
    pub(crate) async fn publish_log_message(
        &self,
        gateway: &DeviceRuntime,
        entry: Entry,
        target_id: &str,
    ) -> bool {
        if target_id == self.gateway_id {
            gateway.publish_log_message(entry).await;
            return true;
        }
        match self.proxies.get(target_id) {
            Some(proxy) => {
                proxy.runtime.publish_log_message(entry).await;
                true
            }
            None => {
                warn!("Dropping log entry for unknown device {}", target_id);
                false
            }
        }
    }

    /// Stop one proxy; it no longer receives messages
    pub(crate) fn deactivate(&mut self, ctx: &EngineContext, device_id: &str) {
        if let Some(proxy) = self.proxies.get_mut(device_id) {
            proxy.runtime.stop();
            proxy.active = false;
            ctx.mark_detached(device_id);
            info!("Proxy device {} deactivated", device_id);
        }
    }

    /// Stop every proxy
    pub(crate) fn shutdown(&mut self) {
        for proxy in self.proxies.values_mut() {
            proxy.runtime.stop();
            proxy.active = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::TargetConfig;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn test_no_proxy_skips_first_lexicographic_id() {
        let options = DeviceOptions {
            no_proxy: true,
            ..DeviceOptions::default()
        };
        let proxies = proxy_ids_for(&ids(&["b-1", "a-2", "c-3"]), &options);
        assert_eq!(proxies, ids(&["b-1", "c-3"]));
    }

    #[test]
    fn test_all_proxied_by_default() {
        let proxies = proxy_ids_for(&ids(&["b-1", "a-2"]), &DeviceOptions::default());
        assert_eq!(proxies, ids(&["a-2", "b-1"]));
    }

    #[test]
    fn test_extra_device_added() {
        let options = DeviceOptions {
            no_proxy: true,
            extra_device: true,
            ..DeviceOptions::default()
        };
        let proxies = proxy_ids_for(&ids(&["a-2"]), &options);
        assert_eq!(proxies, ids(&[EXTRA_PROXY_ID]));
    }

    #[test]
    fn test_gateway_state_passthrough() {
        let config = GatewayConfig {
            proxy_ids: ids(&["a-2"]),
            target: Some(TargetConfig {
                family: Some("vendor".to_string()),
                addr: None,
            }),
        };
        let state = gateway_state(Some(&config)).unwrap();
        assert_eq!(state.target_family.as_deref(), Some("vendor"));
        assert!(gateway_state(None).is_none());
    }

    #[test]
    fn test_gateway_error_entry() {
        let error = GatewayError {
            error_type: Some("attach".to_string()),
            description: Some("device unknown".to_string()),
            device_id: Some("a-2".to_string()),
        };
        let entry = gateway_error_entry(&error);
        assert_eq!(entry.level, Level::Error);
        assert_eq!(entry.category, category::GATEWAY_PROXY_ERROR);
        assert_eq!(entry.message, "attach: device unknown");
    }
}
