//! Common test utilities for contract tests
//!
//! Provides an in-process broker setup, instrumented collaborators and a
//! handle for driving a running engine.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::Stream;

use udmi_core::engine::endpoint::endpoint_blob;
use udmi_core::model::config::IOT_ENDPOINT_CONFIG;
use udmi_core::store::MemoryPersistentStore;
use udmi_core::traits::{InboundMessage, PersistentData, TransportFactory};
use udmi_core::transport::{MemoryBroker, MemoryTransportFactory};
use udmi_core::{
    Collaborators, DeviceConfig, DeviceEngine, EndpointConfiguration, EngineEvent, Error,
    ExitReason, PersistentStore, ProviderRegistry, Result, Transport,
};

/// Host every test device starts on
pub const HOME_HOST: &str = "broker-a";

/// Host redirects point at
pub const OTHER_HOST: &str = "broker-b";

pub fn home_endpoint() -> EndpointConfiguration {
    EndpointConfiguration::new("memory", HOME_HOST)
}

pub fn other_endpoint() -> EndpointConfiguration {
    EndpointConfiguration::new("memory", OTHER_HOST)
}

/// An in-process broker with a counting transport factory registered as `memory`
pub struct Harness {
    pub broker: MemoryBroker,
    pub factory: MemoryTransportFactory,
    pub registry: Arc<ProviderRegistry>,
}

impl Harness {
    pub fn new() -> Self {
        let broker = MemoryBroker::new();
        let factory = MemoryTransportFactory::new(broker.clone());
        let registry = Arc::new(ProviderRegistry::new());
        registry.register_transport("memory", Box::new(factory.clone()));
        Self {
            broker,
            factory,
            registry,
        }
    }

    /// Harness whose transports refuse to attach the given proxies
    pub fn refusing_attach<I, S>(proxy_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let broker = MemoryBroker::new();
        let factory = MemoryTransportFactory::new(broker.clone());
        let registry = Arc::new(ProviderRegistry::new());
        registry.register_transport(
            "memory",
            Box::new(RefusingAttachFactory {
                inner: factory.clone(),
                refused: proxy_ids.into_iter().map(Into::into).collect(),
            }),
        );
        Self {
            broker,
            factory,
            registry,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators::new(Arc::clone(&self.registry))
    }

    /// Deliver a config document to `device_id`; returns the number of
    /// connections it reached
    pub fn send_config(&self, device_id: &str, document: &Value) -> usize {
        self.broker.send_json(device_id, "config", document)
    }

    /// Payloads `device_id` published on `topic`, in order
    pub fn payloads(&self, device_id: &str, topic: &str) -> Vec<Value> {
        self.broker
            .published_on(device_id, topic)
            .into_iter()
            .map(|m| m.payload)
            .collect()
    }
}

/// Device configuration on the home host
pub fn device_config(device_id: &str) -> DeviceConfig {
    DeviceConfig::new(device_id, home_endpoint())
}

/// A minimal config document in ACTIVE mode
pub fn active_config() -> Value {
    json!({
        "version": "1.5.2",
        "timestamp": Utc::now(),
        "system": { "operation": { "mode": "active" } }
    })
}

/// A config document carrying an endpoint redirect blob
pub fn redirect_config(endpoint: &EndpointConfiguration, generation: &str) -> Value {
    let blob = endpoint_blob(endpoint, Some(generation)).expect("endpoint blob");
    let mut document = active_config();
    document["blobset"] = json!({
        "blobs": { IOT_ENDPOINT_CONFIG: blob }
    });
    document
}

/// Wait for the first event matching `predicate`, skipping the others
pub async fn wait_for<F>(events: &mut mpsc::Receiver<EngineEvent>, mut predicate: F) -> EngineEvent
where
    F: FnMut(&EngineEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(3600), async {
        loop {
            match events.recv().await {
                Some(event) if predicate(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for engine event")
}

/// Collect events up to and including the first one matching `predicate`
pub async fn collect_until<F>(
    events: &mut mpsc::Receiver<EngineEvent>,
    mut predicate: F,
) -> Vec<EngineEvent>
where
    F: FnMut(&EngineEvent) -> bool,
{
    let mut collected = Vec::new();
    wait_for(events, |event| {
        collected.push(event.clone());
        predicate(event)
    })
    .await;
    collected
}

/// Drain every event already queued
pub fn drain(events: &mut mpsc::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

pub fn is_config_applied(event: &EngineEvent, device: &str) -> bool {
    matches!(event, EngineEvent::ConfigApplied { device_id, .. } if device_id == device)
}

pub fn is_state_published(event: &EngineEvent, device: &str) -> bool {
    matches!(event, EngineEvent::StatePublished { device_id } if device_id == device)
}

/// A spawned engine and the means to stop it
pub struct RunningEngine {
    pub engine: Arc<DeviceEngine>,
    pub events: mpsc::Receiver<EngineEvent>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Result<ExitReason>>,
}

impl RunningEngine {
    /// Spawn the engine without waiting for it to start
    pub fn spawn(config: DeviceConfig, collaborators: Collaborators) -> Self {
        let (engine, events) = DeviceEngine::new(config, collaborators).expect("engine config");
        let engine = Arc::new(engine);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.run_with_shutdown(shutdown_rx).await }
        });
        Self {
            engine,
            events,
            shutdown: Some(shutdown_tx),
            handle,
        }
    }

    /// Spawn the engine and wait until it is connected
    pub async fn start(config: DeviceConfig, collaborators: Collaborators) -> Self {
        let mut running = Self::spawn(config, collaborators);
        wait_for(&mut running.events, |e| {
            matches!(e, EngineEvent::Started { .. })
        })
        .await;
        running
    }

    pub async fn wait_for<F>(&mut self, predicate: F) -> EngineEvent
    where
        F: FnMut(&EngineEvent) -> bool,
    {
        wait_for(&mut self.events, predicate).await
    }

    /// Send the shutdown signal without waiting
    pub fn signal_shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }

    /// Send the shutdown signal and wait for the run loop to return
    pub async fn stop(mut self) -> Result<ExitReason> {
        self.signal_shutdown();
        self.join().await
    }

    /// Wait for the run loop to return on its own
    pub async fn join(self) -> Result<ExitReason> {
        tokio::time::timeout(Duration::from_secs(3600), self.handle)
            .await
            .expect("engine did not exit")
            .expect("engine task panicked")
    }
}

/// A persistent store that counts calls
pub struct CountingStore {
    inner: MemoryPersistentStore,
    load_count: Arc<AtomicUsize>,
    save_count: Arc<AtomicUsize>,
    flush_count: Arc<AtomicUsize>,
}

impl CountingStore {
    pub fn new() -> Self {
        Self::with_data(PersistentData::default())
    }

    pub fn with_data(data: PersistentData) -> Self {
        Self {
            inner: MemoryPersistentStore::with_data(data),
            load_count: Arc::new(AtomicUsize::new(0)),
            save_count: Arc::new(AtomicUsize::new(0)),
            flush_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn load_count(&self) -> usize {
        self.load_count.load(Ordering::SeqCst)
    }

    pub fn save_count(&self) -> usize {
        self.save_count.load(Ordering::SeqCst)
    }

    pub fn flush_count(&self) -> usize {
        self.flush_count.load(Ordering::SeqCst)
    }

    /// Snapshot of the stored data
    pub async fn snapshot(&self) -> PersistentData {
        self.inner.snapshot().await
    }

    /// Create a new CountingStore that shares counters and data with an existing one
    pub fn sharing_counters_with(other: &Self) -> Self {
        Self {
            inner: other.inner.clone(),
            load_count: Arc::clone(&other.load_count),
            save_count: Arc::clone(&other.save_count),
            flush_count: Arc::clone(&other.flush_count),
        }
    }
}

#[async_trait]
impl PersistentStore for CountingStore {
    async fn load(&self) -> Result<PersistentData> {
        self.load_count.fetch_add(1, Ordering::SeqCst);
        self.inner.load().await
    }

    async fn save(&self, data: &PersistentData) -> Result<()> {
        self.save_count.fetch_add(1, Ordering::SeqCst);
        self.inner.save(data).await
    }

    async fn flush(&self) -> Result<()> {
        self.flush_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory whose transports refuse to attach some proxies
struct RefusingAttachFactory {
    inner: MemoryTransportFactory,
    refused: BTreeSet<String>,
}

impl TransportFactory for RefusingAttachFactory {
    fn create(
        &self,
        device_id: &str,
        endpoint: &EndpointConfiguration,
    ) -> Result<Box<dyn Transport>> {
        Ok(Box::new(RefusingAttachTransport {
            inner: self.inner.create(device_id, endpoint)?,
            refused: self.refused.clone(),
        }))
    }
}

struct RefusingAttachTransport {
    inner: Box<dyn Transport>,
    refused: BTreeSet<String>,
}

#[async_trait]
impl Transport for RefusingAttachTransport {
    async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    async fn attach(&self, device_id: &str) -> Result<()> {
        if self.refused.contains(device_id) {
            return Err(Error::transport(format!("Attach of {} refused", device_id)));
        }
        self.inner.attach(device_id).await
    }

    async fn publish(&self, device_id: &str, topic: &str, payload: &[u8]) -> Result<()> {
        self.inner.publish(device_id, topic, payload).await
    }

    fn watch(&self) -> Pin<Box<dyn Stream<Item = InboundMessage> + Send + 'static>> {
        self.inner.watch()
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    fn transport_name(&self) -> &'static str {
        "refusing-memory"
    }
}

/// Parse an RFC 3339 timestamp from a JSON field
pub fn timestamp(value: &Value) -> DateTime<Utc> {
    serde_json::from_value(value.clone()).expect("timestamp field")
}
