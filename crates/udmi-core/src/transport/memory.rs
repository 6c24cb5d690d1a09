// # Memory Transport
//
// An in-process broker and the transport that talks to it.
//
// ## Purpose
//
// Lets a device engine run without any network: tests drive config into
// the broker and inspect what the device published, embedders wire
// several simulated devices into one process.
//
// ## Behavior
//
// - Each `connect` opens one broker connection for the owning device
// - `attach` adds a proxied device to that connection
// - Messages delivered by the broker go to every live connection
//   subscribed to the addressed device
// - Hosts marked unreachable refuse connections

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::Stream;

use crate::Error;
use crate::model::EndpointConfiguration;
use crate::traits::{InboundMessage, Transport, TransportFactory};

/// A message some device published through the broker
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    /// Host of the connection it was published on
    pub hostname: String,
    pub device_id: String,
    pub topic: String,
    /// Payload parsed as JSON (`Null` when it is not JSON)
    pub payload: serde_json::Value,
    /// When the broker accepted it
    pub at: Instant,
}

#[derive(Debug, Default)]
struct BrokerInner {
    next_connection: u64,
    unreachable: HashSet<String>,
    connections: HashMap<u64, Connection>,
    published: Vec<PublishedMessage>,
}

#[derive(Debug)]
struct Connection {
    hostname: String,
    devices: BTreeSet<String>,
    inbound: mpsc::UnboundedSender<InboundMessage>,
}

/// In-process broker; clones share the same broker
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make connections to `hostname` fail (or succeed again)
    pub fn set_unreachable(&self, hostname: &str, unreachable: bool) {
        let mut inner = self.lock();
        if unreachable {
            inner.unreachable.insert(hostname.to_string());
        } else {
            inner.unreachable.remove(hostname);
        }
    }

    /// Deliver a payload to every connection subscribed to `device_id`
    ///
    /// Returns the number of connections it was delivered to.
    pub fn deliver(&self, device_id: &str, topic: &str, payload: &[u8]) -> usize {
        let inner = self.lock();
        let mut delivered = 0;
        for connection in inner.connections.values() {
            if !connection.devices.contains(device_id) {
                continue;
            }
            let message = InboundMessage::new(device_id, topic, payload.to_vec());
            if connection.inbound.send(message).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver a JSON document to every connection subscribed to `device_id`
    pub fn send_json(&self, device_id: &str, topic: &str, document: &serde_json::Value) -> usize {
        match serde_json::to_vec(document) {
            Ok(payload) => self.deliver(device_id, topic, &payload),
            Err(_) => 0,
        }
    }

    /// Everything published so far, in order
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    /// Messages published by `device_id` on `topic`, in order
    pub fn published_on(&self, device_id: &str, topic: &str) -> Vec<PublishedMessage> {
        self.lock()
            .published
            .iter()
            .filter(|m| m.device_id == device_id && m.topic == topic)
            .cloned()
            .collect()
    }

    pub fn clear_published(&self) {
        self.lock().published.clear();
    }

    /// Whether any live connection is subscribed to `device_id`
    pub fn is_subscribed(&self, device_id: &str) -> bool {
        self.lock()
            .connections
            .values()
            .any(|c| c.devices.contains(device_id))
    }

    /// Hosts of all live connections, sorted
    pub fn connected_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .lock()
            .connections
            .values()
            .map(|c| c.hostname.clone())
            .collect();
        hosts.sort();
        hosts
    }

    fn open(
        &self,
        hostname: &str,
        device_id: &str,
        inbound: mpsc::UnboundedSender<InboundMessage>,
    ) -> Result<u64, Error> {
        let mut inner = self.lock();
        if inner.unreachable.contains(hostname) {
            return Err(Error::transport(format!("Host {} is unreachable", hostname)));
        }
        inner.next_connection += 1;
        let id = inner.next_connection;
        inner.connections.insert(
            id,
            Connection {
                hostname: hostname.to_string(),
                devices: BTreeSet::from([device_id.to_string()]),
                inbound,
            },
        );
        Ok(id)
    }

    fn subscribe(&self, connection: u64, device_id: &str) -> Result<(), Error> {
        let mut inner = self.lock();
        let entry = inner
            .connections
            .get_mut(&connection)
            .ok_or_else(|| Error::transport("Connection is closed"))?;
        entry.devices.insert(device_id.to_string());
        Ok(())
    }

    fn accept(
        &self,
        connection: u64,
        device_id: &str,
        topic: &str,
        payload: &[u8],
    ) -> Result<(), Error> {
        let mut inner = self.lock();
        let hostname = inner
            .connections
            .get(&connection)
            .map(|c| c.hostname.clone())
            .ok_or_else(|| Error::transport("Connection is closed"))?;
        inner.published.push(PublishedMessage {
            hostname,
            device_id: device_id.to_string(),
            topic: topic.to_string(),
            payload: serde_json::from_slice(payload).unwrap_or(serde_json::Value::Null),
            at: Instant::now(),
        });
        Ok(())
    }

    fn drop_connection(&self, connection: u64) {
        self.lock().connections.remove(&connection);
    }
}

/// Transport connected to a [`MemoryBroker`]
pub struct MemoryTransport {
    broker: MemoryBroker,
    hostname: String,
    device_id: String,
    connection: Mutex<Option<u64>>,
    /// Handed to the broker on connect; dropping it ends the watch stream
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<InboundMessage>>>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
}

impl MemoryTransport {
    pub fn new(broker: MemoryBroker, hostname: impl Into<String>, device_id: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            broker,
            hostname: hostname.into(),
            device_id: device_id.into(),
            connection: Mutex::new(None),
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: Mutex::new(Some(rx)),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    fn connection(&self) -> Result<u64, Error> {
        self.connection
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .ok_or_else(|| Error::transport(format!("Not connected to {}", self.hostname)))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<(), Error> {
        let mut connection = self.connection.lock().unwrap_or_else(|e| e.into_inner());
        if connection.is_some() {
            return Ok(());
        }
        let tx = self
            .inbound_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| Error::transport("Transport was closed and cannot reconnect"))?;
        let id = self.broker.open(&self.hostname, &self.device_id, tx)?;
        tracing::debug!("{} connected to memory broker at {}", self.device_id, self.hostname);
        *connection = Some(id);
        Ok(())
    }

    async fn attach(&self, device_id: &str) -> Result<(), Error> {
        let connection = self.connection()?;
        self.broker.subscribe(connection, device_id)
    }

    async fn publish(&self, device_id: &str, topic: &str, payload: &[u8]) -> Result<(), Error> {
        let connection = self.connection()?;
        self.broker.accept(connection, device_id, topic, payload)
    }

    fn watch(&self) -> Pin<Box<dyn Stream<Item = InboundMessage> + Send + 'static>> {
        match self.inbound_rx.lock().unwrap_or_else(|e| e.into_inner()).take() {
            Some(rx) => Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx)),
            None => Box::pin(tokio_stream::empty::<InboundMessage>()),
        }
    }

    async fn close(&self) -> Result<(), Error> {
        let connection = self.connection.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(id) = connection {
            self.broker.drop_connection(id);
        }
        // Never connected: make the stream end as well
        self.inbound_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        Ok(())
    }

    fn transport_name(&self) -> &'static str {
        "memory"
    }
}

/// Factory creating [`MemoryTransport`]s on a shared broker
///
/// Counts every transport it creates.
#[derive(Debug, Clone)]
pub struct MemoryTransportFactory {
    broker: MemoryBroker,
    created: Arc<AtomicUsize>,
}

impl MemoryTransportFactory {
    pub fn new(broker: MemoryBroker) -> Self {
        Self {
            broker,
            created: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of transports created so far
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl TransportFactory for MemoryTransportFactory {
    fn create(
        &self,
        device_id: &str,
        endpoint: &EndpointConfiguration,
    ) -> Result<Box<dyn Transport>, Error> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryTransport::new(
            self.broker.clone(),
            endpoint.hostname.clone(),
            device_id,
        )))
    }
}
