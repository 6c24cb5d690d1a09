//! Core UDMI device engine
//!
//! The DeviceEngine is responsible for:
//! - Connecting to the endpoint (persisted or configured)
//! - Reconciling device state against each received config
//! - Publishing state under the config gate and throttle
//! - Scheduling discovery scans per address family
//! - Fanning config and log delivery out to proxy devices
//! - Redirecting the connection on instruction, with rollback
//!
//! ## Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!   config / errors ──▶│ DeviceEngine │── ExitReason
//!                      └──────────────┘
//!                             │ dispatch by device id
//!             ┌───────────────┴───────────────┐
//!             ▼                               ▼
//!     ┌───────────────┐              ┌────────────────────┐
//!     │ DeviceRuntime │              │ GatewayCoordinator │
//!     │  (gateway)    │              │  ProxyDevice × N   │
//!     └───────────────┘              └────────────────────┘
//!             │ system / pointset / discovery / endpoint
//!             ▼
//!     ┌───────────────┐   ┌───────────┐   ┌─────────────────┐
//!     │ Transport     │   │ Store     │   │ Events          │
//!     │ (publish)     │   │ (persist) │   │ (notify)        │
//!     └───────────────┘   └───────────┘   └─────────────────┘
//! ```
//!
//! ## Config Flow
//!
//! 1. Config arrives on the transport for the gateway or a proxy
//! 2. The device runtime applies it under the device lock
//! 3. The first config opens the publish gate
//! 4. An endpoint blob may redirect the connection
//! 5. State is republished (synchronously on a lifecycle transition)

pub mod device;
pub mod discovery;
pub mod endpoint;
pub mod gateway;
pub mod pointset;
pub mod publisher;
pub mod scheduler;
pub mod system;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::config::DeviceConfig;
use crate::error::{Error, Result};
use crate::model::{
    CONFIG_TOPIC, ERRORS_TOPIC, Entry, GatewayError, Level, State, SystemMode, TopicTable,
    category,
};
use crate::record::NullRecorder;
use crate::registry::ProviderRegistry;
use crate::store::MemoryPersistentStore;
use crate::traits::{
    InboundMessage, MessageMigrator, MessageRecorder, PassthroughMigrator, PersistentStore,
};

pub use device::DeviceRuntime;
use device::EngineContext;
pub use endpoint::EndpointFailover;
pub use gateway::GatewayCoordinator;
pub use publisher::PublishOutcome;

/// Events emitted by the DeviceEngine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Engine connected and started its devices
    Started { device_id: String, proxies: usize },

    /// A config document was applied
    ConfigApplied {
        device_id: String,
        timestamp: Option<DateTime<Utc>>,
    },

    /// State was sent
    StatePublished { device_id: String },

    /// State publication held back until the first config
    StateDeferred { device_id: String },

    /// A discovery scan timer was armed
    DiscoveryScheduled {
        device_id: String,
        family: String,
        generation: DateTime<Utc>,
    },

    /// A discovery scan started
    DiscoveryScanStarted {
        device_id: String,
        family: String,
        generation: DateTime<Utc>,
    },

    /// A discovery scan finished (`found` is None when it failed)
    DiscoveryScanComplete {
        device_id: String,
        family: String,
        generation: DateTime<Utc>,
        found: Option<usize>,
    },

    /// The connection moved to a new endpoint
    EndpointRedirected { hostname: String },

    /// A redirect failed and the connection went back to the working endpoint
    EndpointRolledBack { hostname: String, error: String },

    /// A proxy device was attached and started
    ProxyActivated { device_id: String },

    /// A proxy device could not be attached
    ProxyFailed { device_id: String, error: String },

    /// Config forced a lifecycle transition
    Lifecycle { device_id: String, mode: SystemMode },

    /// Engine stopped
    Stopped { reason: String },
}

/// Why the run loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Shutdown signal
    Shutdown,
    /// Config forced a restart, shutdown or termination
    Lifecycle(SystemMode),
}

impl ExitReason {
    /// Process exit code reported to the supervisor
    pub fn exit_code(self) -> i32 {
        match self {
            ExitReason::Shutdown => 0,
            ExitReason::Lifecycle(mode) => mode.exit_code(),
        }
    }
}

/// Collaborators the engine is composed from
pub struct Collaborators {
    pub registry: Arc<ProviderRegistry>,
    pub store: Arc<dyn PersistentStore>,
    pub recorder: Arc<dyn MessageRecorder>,
    pub migrator: Arc<dyn MessageMigrator>,
    pub topics: TopicTable,
}

impl Collaborators {
    /// In-memory store, no recording, version-stamping migrator
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            store: Arc::new(MemoryPersistentStore::new()),
            recorder: Arc::new(NullRecorder),
            migrator: Arc::new(PassthroughMigrator),
            topics: TopicTable::default(),
        }
    }

    /// Store and recorder as described by the device configuration
    pub async fn from_config(registry: Arc<ProviderRegistry>, config: &DeviceConfig) -> Result<Self> {
        Ok(Self {
            store: crate::store::open(&config.persistence).await?,
            recorder: crate::record::open(&config.recording).await?,
            ..Self::new(registry)
        })
    }

    pub fn with_store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn MessageRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn with_migrator(mut self, migrator: Arc<dyn MessageMigrator>) -> Self {
        self.migrator = migrator;
        self
    }

    pub fn with_topics(mut self, topics: TopicTable) -> Self {
        self.topics = topics;
        self
    }
}

/// Core UDMI device engine
///
/// ## Lifecycle
///
/// 1. Create with [`DeviceEngine::new()`]
/// 2. Start with [`DeviceEngine::run()`]
/// 3. Engine runs until a shutdown signal, a lifecycle transition or a
///    fatal error
/// 4. Workers and timers are stopped, the store is flushed and the
///    connection closed on every exit path
pub struct DeviceEngine {
    config: DeviceConfig,
    ctx: Arc<EngineContext>,
    device: Arc<DeviceRuntime>,
    gateway: tokio::sync::Mutex<GatewayCoordinator>,
    stopped: AtomicBool,
}

impl DeviceEngine {
    /// Create a new device engine
    ///
    /// # Returns
    ///
    /// A tuple of (engine, event_receiver) where event_receiver yields engine events
    pub fn new(
        config: DeviceConfig,
        collaborators: Collaborators,
    ) -> Result<(Self, mpsc::Receiver<EngineEvent>)> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.engine.event_channel_capacity);
        let transport = collaborators
            .registry
            .create_transport(&config.device_id, &config.endpoint)?;

        // Whole seconds, so configured last_start values compare exactly
        let now = Utc::now();
        let device_start = DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now);

        let ctx = Arc::new(EngineContext::new(
            config.device_id.clone(),
            collaborators.registry,
            Arc::from(transport),
            collaborators.topics,
            collaborators.migrator,
            collaborators.recorder,
            collaborators.store,
            tx,
            config.engine.clone(),
            device_start,
        ));

        let failover = EndpointFailover::new(
            config.endpoint.clone(),
            config.options.redirect_registry.clone(),
        );
        let device = DeviceRuntime::new(Arc::clone(&ctx), &config, Some(failover));
        let gateway = GatewayCoordinator::new(config.device_id.clone());

        let engine = Self {
            config,
            ctx,
            device,
            gateway: tokio::sync::Mutex::new(gateway),
            stopped: AtomicBool::new(false),
        };
        Ok((engine, rx))
    }

    pub fn device_id(&self) -> &str {
        &self.config.device_id
    }

    /// Start time of this run, in whole seconds
    pub fn device_start(&self) -> DateTime<Utc> {
        self.ctx.device_start
    }

    /// Run the engine until a shutdown signal (SIGINT) or lifecycle transition
    ///
    /// # Returns
    ///
    /// - `Ok(ExitReason)`: Clean exit
    /// - `Err(Error)`: Fatal error
    pub async fn run(&self) -> Result<ExitReason> {
        self.run_internal(None).await
    }

    /// Run the engine with a programmatic shutdown signal
    ///
    /// Used by embedders and tests instead of OS signals.
    pub async fn run_with_shutdown(&self, shutdown_rx: oneshot::Receiver<()>) -> Result<ExitReason> {
        self.run_internal(Some(shutdown_rx)).await
    }

    async fn run_internal(&self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<ExitReason> {
        let result = self.run_loop(shutdown_rx).await;
        match &result {
            Ok(reason) => info!("Engine exiting: {:?}", reason),
            Err(e) => error!("Engine failed: {}", e),
        }
        self.shutdown(&result).await;
        result
    }

    async fn startup(&self) -> Result<()> {
        let mut data = self.ctx.store.load().await?;
        data.restart_count = data.restart_count.saturating_add(1);
        data.last_start = Some(self.ctx.device_start);
        self.ctx.store.save(&data).await?;

        self.device
            .initialize(&self.config.identity, data.restart_count, &self.config.localnet)
            .await;

        let persisted = data
            .endpoint
            .filter(|endpoint| *endpoint != self.config.endpoint);
        let mut connected = false;
        if let Some(endpoint) = persisted {
            match self.ctx.reset_connection(&endpoint).await {
                Ok(()) => {
                    info!("Using persisted endpoint {}", endpoint.hostname);
                    self.device.set_working_endpoint(endpoint).await;
                    connected = true;
                }
                Err(e) => warn!(
                    "Persisted endpoint {} unusable, using configured endpoint: {}",
                    endpoint.hostname, e
                ),
            }
        }
        if !connected {
            self.ctx.transport.current().connect().await?;
        }

        let proxies = {
            let mut gateway = self.gateway.lock().await;
            gateway.create_proxy_devices(&self.ctx, &self.config).await;
            gateway.activate(&self.ctx, &self.device).await;
            gateway.proxy_ids().len()
        };
        self.device.start_worker();

        info!(
            "Device {} started (restart {}, {} proxies)",
            self.config.device_id, data.restart_count, proxies
        );
        self.device
            .publish_log_message(Entry::new(
                Level::Notice,
                category::SYSTEM_BASE_START,
                format!(
                    "Device {} started at {}",
                    self.config.device_id,
                    self.ctx.device_start.to_rfc3339()
                ),
            ))
            .await;
        self.ctx.emit_event(EngineEvent::Started {
            device_id: self.config.device_id.clone(),
            proxies,
        });
        Ok(())
    }

    async fn run_loop(&self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<ExitReason> {
        self.startup().await?;

        let shutdown = async move {
            match shutdown_rx {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Failed to listen for shutdown signal: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
        };
        tokio::pin!(shutdown);

        let mut generation = self.ctx.transport.subscribe();
        let mut inbound = self.ctx.transport.current().watch();
        let mut inbound_open = true;

        let config_wait = self.config.engine.config_wait_secs.map(Duration::from_secs);
        let config_deadline = config_wait.map(|wait| tokio::time::Instant::now() + wait);

        loop {
            let awaiting_config = config_deadline.is_some() && !self.device.config_received();
            let deadline = config_deadline.unwrap_or_else(tokio::time::Instant::now);

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    return Ok(ExitReason::Shutdown);
                }

                changed = generation.changed() => {
                    if changed.is_ok() {
                        debug!("Connection replaced, watching the new one");
                        inbound = self.ctx.transport.current().watch();
                        inbound_open = true;
                    }
                }

                message = inbound.next(), if inbound_open => {
                    match message {
                        Some(message) => {
                            if let Some(mode) = self.dispatch(message).await? {
                                return Ok(ExitReason::Lifecycle(mode));
                            }
                        }
                        None => {
                            warn!("Inbound stream ended");
                            inbound_open = false;
                        }
                    }
                }

                _ = tokio::time::sleep_until(deadline), if awaiting_config => {
                    return Err(Error::config(format!(
                        "No config received within {:?}",
                        config_wait.unwrap_or_default()
                    )));
                }
            }
        }
    }

    /// Route one inbound message; only fatal errors are returned
    async fn dispatch(&self, message: InboundMessage) -> Result<Option<SystemMode>> {
        let InboundMessage {
            device_id,
            topic,
            payload,
        } = message;

        if device_id == self.config.device_id {
            return match topic.as_str() {
                CONFIG_TOPIC => match self.device.handle_config(&payload).await {
                    Ok(mode) => Ok(mode),
                    Err(e) if e.is_fatal() => Err(e),
                    Err(e) => {
                        error!("Failed to apply config: {}", e);
                        Ok(None)
                    }
                },
                ERRORS_TOPIC => {
                    self.handle_gateway_error(&payload).await;
                    Ok(None)
                }
                other => {
                    debug!("Ignoring message on topic {}", other);
                    Ok(None)
                }
            };
        }

        let Some(proxy) = self.gateway.lock().await.route(&device_id) else {
            debug!("No active device {} for message on {}", device_id, topic);
            return Ok(None);
        };
        if topic != CONFIG_TOPIC {
            debug!("Ignoring {} message for proxy {}", topic, device_id);
            return Ok(None);
        }

        // Proxy failures stay with the proxy
        match proxy.handle_config(&payload).await {
            Ok(None) => {}
            Ok(Some(mode)) => {
                info!("Proxy {} left with {:?}", device_id, mode);
                self.gateway.lock().await.deactivate(&self.ctx, &device_id);
            }
            Err(e) if e.is_fatal() => {
                error!("Proxy {} halted: {}", device_id, e);
                self.gateway.lock().await.deactivate(&self.ctx, &device_id);
            }
            Err(e) => warn!("Proxy {} failed to apply config: {}", device_id, e),
        }
        Ok(None)
    }

    async fn handle_gateway_error(&self, payload: &[u8]) {
        let report: GatewayError = match serde_json::from_slice(payload) {
            Ok(report) => report,
            Err(e) => {
                warn!("Unparseable gateway error report: {}", e);
                return;
            }
        };
        let target = report
            .device_id
            .clone()
            .unwrap_or_else(|| self.config.device_id.clone());
        let entry = gateway::gateway_error_entry(&report);
        self.gateway
            .lock()
            .await
            .publish_log_message(&self.device, entry, &target)
            .await;
    }

    async fn shutdown(&self, result: &Result<ExitReason>) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.gateway.lock().await.shutdown();
        self.device.stop();

        if let Err(e) = self.ctx.store.flush().await {
            error!("Failed to flush persistent store: {}", e);
        }
        if let Err(e) = self.ctx.transport.current().close().await {
            warn!("Failed to close connection: {}", e);
        }

        let reason = match result {
            Ok(ExitReason::Shutdown) => "Shutdown signal".to_string(),
            Ok(ExitReason::Lifecycle(mode)) => format!("Lifecycle transition to {:?}", mode),
            Err(e) => format!("Error: {}", e),
        };
        info!("Store flushed, engine stopped");
        self.ctx.emit_event(EngineEvent::Stopped { reason });
    }

    /// Queue a log entry for the gateway or one of its proxies
    ///
    /// Returns false when `target_id` names no known device.
    pub async fn publish_log_message(&self, entry: Entry, target_id: &str) -> bool {
        self.gateway
            .lock()
            .await
            .publish_log_message(&self.device, entry, target_id)
            .await
    }

    /// Request a state publication for the device itself
    pub async fn publish_state(&self, sync: bool) -> Result<PublishOutcome> {
        self.device.publish_state(sync).await
    }

    /// Wait up to `timeout` for the first config
    pub async fn wait_for_config(&self, timeout: Duration) -> bool {
        self.device.wait_for_config(timeout).await
    }

    /// Current state of the device itself
    pub async fn state_snapshot(&self) -> State {
        self.device.state_snapshot().await
    }

    /// Current state of a proxy device
    pub async fn proxy_state(&self, device_id: &str) -> Option<State> {
        let proxy = self.gateway.lock().await.proxy(device_id)?;
        Some(proxy.state_snapshot().await)
    }

    /// Recent entries of the device's local log
    pub async fn local_log(&self) -> Vec<Entry> {
        self.device.local_log().await
    }

    /// Ids of the proxy devices, sorted
    pub async fn proxy_ids(&self) -> Vec<String> {
        self.gateway.lock().await.proxy_ids()
    }

    /// Whether a proxy device is attached and running
    pub async fn is_proxy_active(&self, device_id: &str) -> bool {
        self.gateway.lock().await.is_active(device_id)
    }

    /// Update a point reading of the device itself
    pub async fn set_point_reading(&self, name: &str, value: serde_json::Value) -> bool {
        self.device.set_point_reading(name, value).await
    }

    /// Number of armed discovery timers on the device itself
    pub fn armed_timers(&self) -> usize {
        self.device.armed_timers()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_event_equality() {
        let event = EngineEvent::Lifecycle {
            device_id: "AHU-1".to_string(),
            mode: SystemMode::Restart,
        };
        assert_eq!(event.clone(), event);
    }

    #[test]
    fn test_exit_reason_codes() {
        assert_eq!(ExitReason::Shutdown.exit_code(), 0);
        assert_eq!(ExitReason::Lifecycle(SystemMode::Restart).exit_code(), 192);
        assert_eq!(ExitReason::Lifecycle(SystemMode::Terminate).exit_code(), 193);
        assert_eq!(ExitReason::Lifecycle(SystemMode::Shutdown).exit_code(), 0);
    }
}
