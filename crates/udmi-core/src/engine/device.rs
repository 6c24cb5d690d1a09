//! Device runtime
//!
//! One runtime per device identity: the gateway (or a plain device) and
//! each of its proxies. A runtime owns the Config/State mirror and the
//! components reconciling it, plus a publisher worker and its timers.
//! All runtimes of one engine share an [`EngineContext`]: the current
//! transport connection, the collaborators and the event channel.
//!
//! ## Locking
//!
//! The per-device `core` mutex is held while a config is applied and
//! while state is serialized and sent, so the two never interleave.
//! It is never held across a connection reset. State sends are also
//! serialized by `send_lock`. It is taken before `core` and held across
//! the throttle wait, so two senders never share a window.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use super::EngineEvent;
use super::discovery::{ArmedScan, DiscoveryScheduler, ScanRequest};
use super::endpoint::{EndpointFailover, RedirectPlan, sha256_hex};
use super::gateway;
use super::pointset::PointsetManager;
use super::publisher::{PublishOutcome, StatePublisher};
use super::scheduler::Scheduler;
use super::system::SystemLifecycle;
use crate::config::{DeviceConfig, DeviceIdentity, EngineConfig};
use crate::error::{Error, Result};
use crate::model::{
    CONFIG_TOPIC, Config, DiscoveryEvents, DocumentKind, EndpointConfiguration, Entry, Level,
    OutgoingMessage, State, SystemMode, TopicTable, UDMI_VERSION, category,
};
use crate::model::state::{FamilyLocalnetState, LocalnetState};
use crate::registry::ProviderRegistry;
use crate::traits::{Direction, MessageMigrator, MessageRecorder, PersistentStore, Transport};

/// The live transport connection, swapped on redirect and rollback
pub(crate) struct TransportSlot {
    current: RwLock<Arc<dyn Transport>>,
    generation: watch::Sender<u64>,
}

impl TransportSlot {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            current: RwLock::new(transport),
            generation,
        }
    }

    pub(crate) fn current(&self) -> Arc<dyn Transport> {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Install a new connection, returning the previous one
    pub(crate) fn replace(&self, transport: Arc<dyn Transport>) -> Arc<dyn Transport> {
        let previous = {
            let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *current, transport)
        };
        self.generation.send_modify(|generation| *generation += 1);
        previous
    }

    /// Notified each time the connection is replaced
    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }
}

/// Everything the runtimes of one engine share
pub(crate) struct EngineContext {
    pub(crate) device_id: String,
    pub(crate) registry: Arc<ProviderRegistry>,
    pub(crate) transport: TransportSlot,
    pub(crate) topics: TopicTable,
    pub(crate) migrator: Arc<dyn MessageMigrator>,
    pub(crate) recorder: Arc<dyn MessageRecorder>,
    pub(crate) store: Arc<dyn PersistentStore>,
    pub(crate) events: mpsc::Sender<EngineEvent>,
    pub(crate) config: EngineConfig,
    pub(crate) device_start: DateTime<Utc>,
    /// Proxies subscribed through the current connection
    attached: Mutex<BTreeSet<String>>,
}

impl EngineContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        device_id: String,
        registry: Arc<ProviderRegistry>,
        transport: Arc<dyn Transport>,
        topics: TopicTable,
        migrator: Arc<dyn MessageMigrator>,
        recorder: Arc<dyn MessageRecorder>,
        store: Arc<dyn PersistentStore>,
        events: mpsc::Sender<EngineEvent>,
        config: EngineConfig,
        device_start: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id,
            registry,
            transport: TransportSlot::new(transport),
            topics,
            migrator,
            recorder,
            store,
            events,
            config,
            device_start,
            attached: Mutex::new(BTreeSet::new()),
        }
    }

    pub(crate) fn emit_event(&self, event: EngineEvent) {
        // Drop rather than block when nobody drains the channel
        if self.events.try_send(event).is_err() {
            warn!("Event channel full, dropping event. Consider increasing event_channel_capacity.");
        }
    }

    pub(crate) fn mark_attached(&self, device_id: &str) {
        self.attached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(device_id.to_string());
    }

    pub(crate) fn mark_detached(&self, device_id: &str) {
        self.attached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(device_id);
    }

    fn attached_ids(&self) -> Vec<String> {
        self.attached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Migrate, record and send one outgoing message for `device_id`
    pub(crate) async fn publish_message(
        &self,
        device_id: &str,
        target_version: Option<&str>,
        message: OutgoingMessage,
    ) -> Result<()> {
        let kind = message.kind();
        let document = self.migrator.downgrade(
            kind.document_kind(),
            message.to_value()?,
            target_version.unwrap_or(UDMI_VERSION),
        )?;
        let topic = self.topics.suffix(kind);

        if let Err(e) = self
            .recorder
            .record(device_id, Direction::Outbound, topic, &document)
            .await
        {
            warn!("Failed to record outbound {} for {}: {}", topic, device_id, e);
        }

        let payload = serde_json::to_vec(&document)?;
        let transport = self.transport.current();
        let timeout = self.config.publish_timeout();
        match tokio::time::timeout(timeout, transport.publish(device_id, topic, &payload)).await {
            Ok(result) => result,
            Err(_) => Err(Error::PublishTimeout(timeout)),
        }
    }

    /// Connect to `endpoint` and make it the live connection
    ///
    /// Attached proxies are re-attached on the new connection before it is
    /// installed. The previous connection is closed only on success.
    pub(crate) async fn reset_connection(&self, endpoint: &EndpointConfiguration) -> Result<()> {
        let transport: Arc<dyn Transport> =
            Arc::from(self.registry.create_transport(&self.device_id, endpoint)?);
        transport.connect().await?;

        for proxy_id in self.attached_ids() {
            if let Err(e) = transport.attach(&proxy_id).await {
                if let Err(close) = transport.close().await {
                    debug!("Closing abandoned connection failed: {}", close);
                }
                return Err(e);
            }
        }

        let previous = self.transport.replace(transport);
        if let Err(e) = previous.close().await {
            warn!("Failed to close previous connection: {}", e);
        }
        info!(
            "Connection reset to {} via {}",
            endpoint.hostname, endpoint.protocol
        );
        Ok(())
    }

    /// Save `endpoint` so the next start connects to it
    pub(crate) async fn persist_endpoint(&self, endpoint: &EndpointConfiguration) -> Result<()> {
        let mut data = self.store.load().await?;
        data.endpoint = Some(endpoint.clone());
        self.store.save(&data).await
    }
}

struct DeviceCore {
    state: State,
    last_config: Option<Config>,
    system: SystemLifecycle,
    pointset: PointsetManager,
    discovery: DiscoveryScheduler,
    /// Digest of the config seen for each config_base
    config_bases: HashMap<String, String>,
    /// Present on the device owning the connection only
    endpoint: Option<EndpointFailover>,
    /// Version of the last received config; replies are downgraded to it
    target_version: Option<String>,
    reports_gateway: bool,
}

pub struct DeviceRuntime {
    device_id: String,
    ctx: Arc<EngineContext>,
    core: tokio::sync::Mutex<DeviceCore>,
    publisher: StatePublisher,
    send_lock: tokio::sync::Mutex<()>,
    scheduler: Scheduler,
    /// Armed discovery timers by family
    discovery_timers: Mutex<HashMap<String, Vec<AbortHandle>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceRuntime {
    pub(crate) fn new(
        ctx: Arc<EngineContext>,
        config: &DeviceConfig,
        endpoint: Option<EndpointFailover>,
    ) -> Arc<Self> {
        let engine = &ctx.config;
        let core = DeviceCore {
            state: State::default(),
            last_config: None,
            system: SystemLifecycle::new(
                config.device_id.clone(),
                ctx.device_start,
                &config.options,
                engine.local_log_capacity,
            ),
            pointset: PointsetManager::new(&config.points, engine.sample_rate()),
            discovery: DiscoveryScheduler::new(ctx.device_start),
            config_bases: HashMap::new(),
            endpoint,
            target_version: None,
            reports_gateway: config.gateway.is_some(),
        };
        Arc::new(Self {
            device_id: config.device_id.clone(),
            publisher: StatePublisher::new(engine.state_throttle()),
            send_lock: tokio::sync::Mutex::new(()),
            scheduler: Scheduler::new(),
            discovery_timers: Mutex::new(HashMap::new()),
            core: tokio::sync::Mutex::new(core),
            worker: Mutex::new(None),
            ctx,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Fill identity, start and localnet fields of the state
    pub(crate) async fn initialize(
        &self,
        identity: &DeviceIdentity,
        restart_count: u32,
        localnet: &BTreeMap<String, String>,
    ) {
        let mut guard = self.core.lock().await;
        let core = &mut *guard;
        core.system
            .initialize_state(identity, restart_count, &mut core.state.system);
        core.pointset.update_config(None, &mut core.state.pointset);
        core.state.localnet = if localnet.is_empty() {
            None
        } else {
            let families = localnet
                .iter()
                .map(|(family, addr)| (family.clone(), FamilyLocalnetState { addr: addr.clone() }))
                .collect();
            Some(LocalnetState { families })
        };
    }

    /// Make `endpoint` the working endpoint without connecting
    pub(crate) async fn set_working_endpoint(&self, endpoint: EndpointConfiguration) {
        if let Some(failover) = self.core.lock().await.endpoint.as_mut() {
            failover.set_working(endpoint);
        }
    }

    /// Start the publisher worker: flushes dirty state and sends telemetry
    pub(crate) fn start_worker(self: &Arc<Self>) {
        let device = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut next_tick = tokio::time::Instant::now() + device.ctx.config.sample_rate();
            loop {
                tokio::select! {
                    _ = device.publisher.notified() => {
                        device.flush_state().await;
                    }
                    _ = tokio::time::sleep_until(next_tick) => {
                        let rate = device.publish_telemetry().await;
                        next_tick = tokio::time::Instant::now() + rate;
                    }
                }
            }
        });

        let previous = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stop the worker and abort every armed timer
    pub(crate) fn stop(&self) {
        if let Some(handle) = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        self.scheduler.shutdown();
    }

    /// Number of armed timers (discovery scans)
    pub fn armed_timers(&self) -> usize {
        self.scheduler.armed()
    }

    pub async fn state_snapshot(&self) -> State {
        self.core.lock().await.state.clone()
    }

    pub async fn last_config(&self) -> Option<Config> {
        self.core.lock().await.last_config.clone()
    }

    pub async fn local_log(&self) -> Vec<Entry> {
        self.core.lock().await.system.local_log()
    }

    /// Queue an entry for the next `events/system`
    pub async fn publish_log_message(&self, entry: Entry) {
        self.core.lock().await.system.publish_log_message(entry);
    }

    /// Update a point reading; returns false for unknown points
    pub async fn set_point_reading(&self, name: &str, value: serde_json::Value) -> bool {
        self.core.lock().await.pointset.set_reading(name, value)
    }

    pub fn config_received(&self) -> bool {
        self.publisher.is_open()
    }

    /// Wait up to `timeout` for the first config
    pub async fn wait_for_config(&self, timeout: Duration) -> bool {
        self.publisher.wait_open(timeout).await
    }

    /// Request a state publication
    ///
    /// Asynchronous requests only mark the state dirty and return; the
    /// worker sends it once the throttle window allows. Synchronous
    /// requests wait out the throttle window and the send itself.
    pub async fn publish_state(&self, sync: bool) -> Result<PublishOutcome> {
        if !sync {
            self.publisher.mark_dirty();
            return Ok(PublishOutcome::Sent);
        }
        if !self.publisher.is_open() {
            self.publisher.keep_dirty();
            self.ctx.emit_event(EngineEvent::StateDeferred {
                device_id: self.device_id.clone(),
            });
            return Ok(PublishOutcome::Deferred);
        }

        match self.send_state(false).await {
            Ok(_) => Ok(PublishOutcome::Sent),
            Err(e) => {
                self.publisher.mark_dirty();
                Err(e)
            }
        }
    }

    async fn flush_state(&self) {
        if !self.publisher.is_dirty() {
            return;
        }
        if !self.publisher.is_open() {
            debug!("State of {} held until the first config", self.device_id);
            self.ctx.emit_event(EngineEvent::StateDeferred {
                device_id: self.device_id.clone(),
            });
            return;
        }

        if let Err(e) = self.send_state(true).await {
            // Retried on the next throttle window
            warn!("Failed to publish state for {}: {}", self.device_id, e);
            self.publisher.mark_dirty();
        }
    }

    /// Send the current state once the throttle window allows
    ///
    /// With `only_dirty`, nothing is sent if another caller already sent
    /// the pending change. Returns whether state was sent.
    async fn send_state(&self, only_dirty: bool) -> Result<bool> {
        let _serial = self.send_lock.lock().await;
        loop {
            let wait = self.publisher.remaining_throttle();
            if wait.is_zero() {
                break;
            }
            tokio::time::sleep(wait).await;
        }
        if !self.publisher.take_dirty() && only_dirty {
            return Ok(false);
        }

        let core = self.core.lock().await;
        let mut snapshot = core.state.clone();
        snapshot.timestamp = Some(Utc::now());
        self.publisher.record_publish();

        self.ctx
            .publish_message(
                &self.device_id,
                core.target_version.as_deref(),
                OutgoingMessage::State(snapshot),
            )
            .await?;
        drop(core);

        debug!("Published state for {}", self.device_id);
        self.ctx.emit_event(EngineEvent::StatePublished {
            device_id: self.device_id.clone(),
        });
        Ok(true)
    }

    /// Send `events/pointset` and buffered `events/system`; returns the
    /// cadence until the next tick
    async fn publish_telemetry(&self) -> Duration {
        let mut core = self.core.lock().await;
        let rate = core.pointset.sample_rate();
        if !self.publisher.is_open() {
            return rate;
        }

        let messages = [
            core.pointset.take_event().map(OutgoingMessage::Pointset),
            core.system.take_system_event().map(OutgoingMessage::System),
        ];
        let version = core.target_version.clone();
        for message in messages.into_iter().flatten() {
            let kind = self.ctx.topics.suffix(message.kind()).to_string();
            if let Err(e) = self
                .ctx
                .publish_message(&self.device_id, version.as_deref(), message)
                .await
            {
                warn!("Failed to publish {} for {}: {}", kind, self.device_id, e);
            }
        }
        drop(core);
        rate
    }

    /// Apply a config document received on the `config` topic
    ///
    /// Returns the lifecycle mode when the config forces a transition.
    /// Malformed documents are logged as entries and otherwise ignored;
    /// only fatal errors are returned.
    pub(crate) async fn handle_config(self: &Arc<Self>, payload: &[u8]) -> Result<Option<SystemMode>> {
        let document: serde_json::Value = match serde_json::from_slice(payload) {
            Ok(document) => document,
            Err(e) => {
                let err = Error::invalid_message(format!("Unparseable config: {}", e));
                self.publish_log_message(Entry::from_error(category::SYSTEM_CONFIG_PARSE, &err))
                    .await;
                return Ok(None);
            }
        };

        if let Err(e) = self
            .ctx
            .recorder
            .record(&self.device_id, Direction::Inbound, CONFIG_TOPIC, &document)
            .await
        {
            warn!("Failed to record inbound config for {}: {}", self.device_id, e);
        }

        let digest = sha256_hex(&serde_json::to_vec(&document)?);
        let config: Config = match self
            .ctx
            .migrator
            .upgrade(DocumentKind::Config, document)
            .and_then(|upgraded| Ok(serde_json::from_value::<Config>(upgraded)?))
        {
            Ok(config) => config,
            Err(e) => {
                self.publish_log_message(Entry::from_error(category::SYSTEM_CONFIG_PARSE, &e))
                    .await;
                return Ok(None);
            }
        };

        let (transition, timers, cancelled) = {
            let mut guard = self.core.lock().await;
            let core = &mut *guard;

            if let Some(base) = &config.config_base {
                match core.config_bases.get(base) {
                    Some(seen) if *seen != digest => {
                        return Err(Error::protocol_violation(format!(
                            "config_base {} received again with different content",
                            base
                        )));
                    }
                    Some(_) => {}
                    None => {
                        core.config_bases.insert(base.clone(), digest);
                    }
                }
            }

            core.state.system.last_config = config.timestamp;
            core.system.update_config(config.system.as_ref());
            if core.reports_gateway {
                core.state.gateway = gateway::gateway_state(config.gateway.as_ref());
            }

            let mut entries = core
                .pointset
                .update_config(config.pointset.as_ref(), &mut core.state.pointset);
            let discovery = core.discovery.update_discovery_scan(
                config.discovery.as_ref(),
                &mut core.state.discovery,
                Utc::now(),
            );
            entries.extend(discovery.entries);
            if let Some(failover) = core.endpoint.as_mut() {
                entries.extend(failover.update_config(&config, &mut core.state.blobset));
            }

            for entry in entries {
                core.system.publish_log_message(entry);
            }
            let transition = core.system.maybe_restart_system(&mut core.state.system);
            core.target_version = config.version.clone();
            core.last_config = Some(config.clone());
            (transition, discovery.timers, discovery.cancelled)
        };

        for family in &cancelled {
            self.cancel_discovery_timers(family);
        }
        for scan in timers {
            self.arm_discovery_scan(scan);
        }

        if self.publisher.open_gate() {
            info!("Initial config received for {}", self.device_id);
        }
        self.ctx.emit_event(EngineEvent::ConfigApplied {
            device_id: self.device_id.clone(),
            timestamp: config.timestamp,
        });

        self.maybe_redirect().await?;

        if let Some(mode) = transition {
            info!("{} transitioning to {:?}", self.device_id, mode);
            self.ctx.emit_event(EngineEvent::Lifecycle {
                device_id: self.device_id.clone(),
                mode,
            });
            if let Err(e) = self.publish_state(true).await {
                warn!("Final state publish for {} failed: {}", self.device_id, e);
            }
            return Ok(Some(mode));
        }

        self.publish_state(false).await?;
        Ok(None)
    }

    fn arm_discovery_scan(self: &Arc<Self>, scan: ArmedScan) {
        self.ctx.emit_event(EngineEvent::DiscoveryScheduled {
            device_id: self.device_id.clone(),
            family: scan.family.clone(),
            generation: scan.generation,
        });
        let family = scan.family.clone();
        let device = Arc::downgrade(self);
        let handle = self.scheduler.schedule_at(scan.generation, async move {
            if let Some(device) = device.upgrade() {
                device.check_discovery_scan(scan.family, scan.generation).await;
            }
        });

        let mut timers = self
            .discovery_timers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let armed = timers.entry(family).or_default();
        armed.retain(|timer| !timer.is_finished());
        armed.push(handle);
    }

    /// Abort the timers (and any running scan) of a stopped or removed family
    fn cancel_discovery_timers(&self, family: &str) {
        let armed = self
            .discovery_timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(family);
        for timer in armed.into_iter().flatten() {
            timer.abort();
        }
    }

    /// Timer callback: start the scan if the family still waits for it
    async fn check_discovery_scan(self: Arc<Self>, family: String, generation: DateTime<Utc>) {
        let request = {
            let mut guard = self.core.lock().await;
            let core = &mut *guard;
            core.discovery
                .check_discovery_scan(&family, generation, &mut core.state.discovery)
        };
        let Some(request) = request else {
            debug!("Discovery timer for {} at {} superseded", family, generation);
            return;
        };

        info!("Starting {} discovery scan for {}", family, self.device_id);
        self.ctx.emit_event(EngineEvent::DiscoveryScanStarted {
            device_id: self.device_id.clone(),
            family: family.clone(),
            generation,
        });
        self.publisher.mark_dirty();

        let outcome = self.execute_scan(&request).await;
        let found = outcome.as_ref().ok().copied();

        let update = {
            let mut guard = self.core.lock().await;
            let core = &mut *guard;
            let update = core.discovery.complete_discovery_scan(
                &family,
                generation,
                outcome,
                &mut core.state.discovery,
                Utc::now(),
            );
            for entry in &update.entries {
                core.system.publish_log_message(entry.clone());
            }
            update
        };
        for scan in update.timers {
            self.arm_discovery_scan(scan);
        }

        self.ctx.emit_event(EngineEvent::DiscoveryScanComplete {
            device_id: self.device_id.clone(),
            family,
            generation,
            found,
        });
        self.publisher.mark_dirty();
    }

    async fn execute_scan(&self, request: &ScanRequest) -> std::result::Result<usize, Entry> {
        let family = &request.family;
        let Some(provider) = self.ctx.registry.scan_provider(family) else {
            return Err(Entry::new(
                Level::Error,
                category::DISCOVERY_FAMILY_SCAN,
                format!("No scan provider registered for family {}", family),
            ));
        };

        let limit = self.ctx.config.scan_duration();
        let devices = match tokio::time::timeout(limit, provider.scan(family, request.depth)).await {
            Ok(Ok(devices)) => devices,
            Ok(Err(e)) => return Err(Entry::from_error(category::DISCOVERY_FAMILY_SCAN, &e)),
            Err(_) => {
                let err = Error::scan(family.as_str(), format!("scan did not finish within {:?}", limit));
                return Err(Entry::from_error(category::DISCOVERY_FAMILY_SCAN, &err));
            }
        };

        for device in &devices {
            let event = DiscoveryEvents {
                version: None,
                timestamp: Utc::now(),
                generation: request.generation,
                scan_family: family.clone(),
                scan_addr: device.addr.clone(),
                network: device.network.clone(),
                refs: device.refs.clone(),
            };
            let core = self.core.lock().await;
            if let Err(e) = self
                .ctx
                .publish_message(
                    &self.device_id,
                    core.target_version.as_deref(),
                    OutgoingMessage::Discovery(event),
                )
                .await
            {
                warn!("Failed to publish discovery of {}: {}", device.addr, e);
            }
        }
        debug!("{} discovery found {} devices", family, devices.len());
        Ok(devices.len())
    }

    /// Act on the endpoint blob of the last config
    ///
    /// Only a failed rollback is returned as an error; it is fatal.
    async fn maybe_redirect(&self) -> Result<()> {
        let plan = {
            let mut guard = self.core.lock().await;
            let core = &mut *guard;
            match core.endpoint.as_mut() {
                Some(failover) => failover.plan_redirect(&mut core.state.blobset)?,
                None => return Ok(()),
            }
        };

        let target = match plan {
            RedirectPlan::Noop => return Ok(()),
            RedirectPlan::Cleared => {
                self.publisher.mark_dirty();
                return Ok(());
            }
            RedirectPlan::Rejected(entry) => {
                self.publish_log_message(entry).await;
                if let Err(e) = self.publish_state(true).await {
                    warn!("Failed to publish rejected blob state: {}", e);
                }
                return Ok(());
            }
            RedirectPlan::Attempt(target) => target,
        };

        info!("Redirecting {} to endpoint {}", self.device_id, target.hostname);
        if let Err(e) = self.publish_state(true).await {
            warn!("Failed to publish blob apply state: {}", e);
        }

        let attempt = match self.ctx.reset_connection(&target).await {
            Ok(()) => self.ctx.persist_endpoint(&target).await,
            Err(e) => Err(e),
        };

        match attempt {
            Ok(()) => {
                {
                    let mut guard = self.core.lock().await;
                    let core = &mut *guard;
                    if let Some(failover) = core.endpoint.as_mut() {
                        failover.redirect_succeeded(target.clone(), &mut core.state.blobset);
                    }
                }
                self.publisher.mark_dirty();
                self.ctx.emit_event(EngineEvent::EndpointRedirected {
                    hostname: target.hostname.clone(),
                });
                Ok(())
            }
            Err(e) => {
                warn!("Redirect to {} failed, rolling back: {}", target.hostname, e);
                let working = {
                    let mut guard = self.core.lock().await;
                    let core = &mut *guard;
                    let Some(failover) = core.endpoint.as_mut() else {
                        return Err(Error::fatal("Endpoint controller missing during rollback"));
                    };
                    let entry = failover.redirect_failed(&e, &mut core.state.blobset);
                    let working = failover.working_endpoint().clone();
                    core.system.publish_log_message(entry);
                    working
                };

                match self.ctx.reset_connection(&working).await {
                    Ok(()) => {
                        self.ctx.emit_event(EngineEvent::EndpointRolledBack {
                            hostname: working.hostname.clone(),
                            error: e.to_string(),
                        });
                        self.publisher.mark_dirty();
                        Ok(())
                    }
                    Err(rollback) => {
                        error!("Rollback to {} failed: {}", working.hostname, rollback);
                        Err(Error::fatal(format!(
                            "Redirect to {} failed ({}) and rollback to {} failed ({})",
                            target.hostname, e, working.hostname, rollback
                        )))
                    }
                }
            }
        }
    }
}
