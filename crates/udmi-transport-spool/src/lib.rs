// # Spool Transport
//
// This crate provides a directory-spool transport for the UDMI device
// engine.
//
// ## Purpose
//
// Lets a device talk to a controller that shares a filesystem with it
// (a sidecar bridge, a test rig, an air-gapped handoff) without any
// broker client:
// - Outbound messages are written as JSON files into the device's outbox
// - Inbound messages are picked up by polling the device's inbox
//
// ## Layout
//
// The endpoint hostname names the spool root directory:
//
// ```text
// <root>/<device_id>/outbox/<topic>/<sequence>.json   written by the device
// <root>/<device_id>/inbox/config/*.json              read and removed
// <root>/<device_id>/inbox/errors/*.json              read and removed
// ```
//
// Every file is written to a `.tmp` name first and renamed into place, so
// readers on either side never see partial documents. A missing root
// directory makes `connect` fail, which is how an unusable redirect target
// shows up.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;

use udmi_core::model::{CONFIG_TOPIC, ERRORS_TOPIC};
use udmi_core::traits::{InboundMessage, Transport, TransportFactory};
use udmi_core::{EndpointConfiguration, Error, ProviderRegistry, Result};

/// Protocol name the transport registers under
pub const SPOOL_PROTOCOL: &str = "spool";

/// Default inbox polling interval
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Topics picked up from the inbox
const INBOUND_TOPICS: &[&str] = &[CONFIG_TOPIC, ERRORS_TOPIC];

const OUTBOX_DIR: &str = "outbox";
const INBOX_DIR: &str = "inbox";

/// A spool root directory
///
/// Used by the transport, and by whatever sits on the other side of the
/// spool to hand messages in and collect what the device wrote.
#[derive(Debug, Clone)]
pub struct SpoolDirectory {
    root: PathBuf,
}

/// A message the device wrote to its outbox
#[derive(Debug, Clone)]
pub struct SpooledMessage {
    pub device_id: String,
    pub topic: String,
    pub path: PathBuf,
    /// Payload parsed as JSON (`Null` when it is not JSON)
    pub payload: serde_json::Value,
}

impl SpoolDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn device_dir(&self, device_id: &str) -> PathBuf {
        self.root.join(device_id)
    }

    pub fn inbox(&self, device_id: &str, topic: &str) -> PathBuf {
        self.device_dir(device_id).join(INBOX_DIR).join(topic)
    }

    pub fn outbox(&self, device_id: &str, topic: &str) -> PathBuf {
        self.device_dir(device_id).join(OUTBOX_DIR).join(topic)
    }

    /// Create the inbox and outbox directories of a device
    async fn prepare(&self, device_id: &str) -> Result<()> {
        for topic in INBOUND_TOPICS {
            fs::create_dir_all(self.inbox(device_id, topic)).await?;
        }
        fs::create_dir_all(self.device_dir(device_id).join(OUTBOX_DIR)).await?;
        Ok(())
    }

    /// Hand a message to a device by dropping it into its inbox
    pub async fn deliver(&self, device_id: &str, topic: &str, payload: &[u8]) -> Result<PathBuf> {
        let dir = self.inbox(device_id, topic);
        fs::create_dir_all(&dir).await?;
        let path = dir.join(sequence_name(next_sequence()));
        write_atomic(&path, payload).await?;
        Ok(path)
    }

    /// Messages the device wrote on `topic`, oldest first
    ///
    /// Files are left in place.
    pub async fn outbox_messages(&self, device_id: &str, topic: &str) -> Result<Vec<SpooledMessage>> {
        let mut messages = Vec::new();
        for path in list_documents(&self.outbox(device_id, topic)).await? {
            let bytes = fs::read(&path).await?;
            messages.push(SpooledMessage {
                device_id: device_id.to_string(),
                topic: topic.to_string(),
                payload: serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null),
                path,
            });
        }
        Ok(messages)
    }
}

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Monotonic within a process, ordered across restarts by wall clock
fn next_sequence() -> (u128, u64) {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    (nanos, SEQUENCE.fetch_add(1, Ordering::SeqCst))
}

fn sequence_name((nanos, seq): (u128, u64)) -> String {
    format!("{:020}-{:08}.json", nanos, seq)
}

/// Write via a temporary file and rename into place
async fn write_atomic(path: &Path, payload: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("json.tmp");
    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(payload).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&temp_path, path).await?;
    Ok(())
}

/// Complete documents in a directory, sorted by name
async fn list_documents(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Transport exchanging messages through a spool directory
pub struct SpoolTransport {
    spool: SpoolDirectory,
    device_id: String,
    poll_interval: Duration,
    devices: Arc<Mutex<BTreeSet<String>>>,
    poller: Mutex<Option<JoinHandle<()>>>,
    /// Moved into the poller on connect; dropping it ends the watch stream
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<InboundMessage>>>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
}

impl SpoolTransport {
    pub fn new(root: impl Into<PathBuf>, device_id: impl Into<String>) -> Self {
        Self::with_interval(
            root,
            device_id,
            Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        )
    }

    /// Create with a custom inbox polling interval
    pub fn with_interval(
        root: impl Into<PathBuf>,
        device_id: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            spool: SpoolDirectory::new(root),
            device_id: device_id.into(),
            poll_interval,
            devices: Arc::new(Mutex::new(BTreeSet::new())),
            poller: Mutex::new(None),
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: Mutex::new(Some(rx)),
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        let poller = self.poller.lock().unwrap_or_else(|e| e.into_inner());
        if poller.is_none() {
            return Err(Error::transport(format!(
                "Not connected to spool {}",
                self.spool.root().display()
            )));
        }
        Ok(())
    }

    fn subscribed(&self, device_id: &str) -> bool {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(device_id)
    }
}

#[async_trait]
impl Transport for SpoolTransport {
    async fn connect(&self) -> Result<()> {
        if self.ensure_connected().is_ok() {
            return Ok(());
        }
        let root = self.spool.root();
        if !fs::metadata(root).await.is_ok_and(|m| m.is_dir()) {
            return Err(Error::transport(format!(
                "Spool root {} is not a directory",
                root.display()
            )));
        }
        self.spool.prepare(&self.device_id).await.map_err(|e| {
            Error::transport(format!("Failed to prepare spool for {}: {}", self.device_id, e))
        })?;

        let tx = self
            .inbound_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| Error::transport("Transport was closed and cannot reconnect"))?;
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(self.device_id.clone());

        let handle = tokio::spawn(poll_inbox(
            self.spool.clone(),
            Arc::clone(&self.devices),
            self.poll_interval,
            tx,
        ));
        *self.poller.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        tracing::debug!("{} connected to spool at {}", self.device_id, root.display());
        Ok(())
    }

    async fn attach(&self, device_id: &str) -> Result<()> {
        self.ensure_connected()?;
        self.spool.prepare(device_id).await.map_err(|e| {
            Error::transport(format!("Failed to prepare spool for {}: {}", device_id, e))
        })?;
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(device_id.to_string());
        Ok(())
    }

    async fn publish(&self, device_id: &str, topic: &str, payload: &[u8]) -> Result<()> {
        self.ensure_connected()?;
        if !self.subscribed(device_id) {
            return Err(Error::transport(format!(
                "Device {} is not attached to this connection",
                device_id
            )));
        }
        let dir = self.spool.outbox(device_id, topic);
        fs::create_dir_all(&dir).await?;
        write_atomic(&dir.join(sequence_name(next_sequence())), payload)
            .await
            .map_err(|e| Error::transport(format!("Failed to spool {} for {}: {}", topic, device_id, e)))
    }

    fn watch(&self) -> Pin<Box<dyn Stream<Item = InboundMessage> + Send + 'static>> {
        match self.inbound_rx.lock().unwrap_or_else(|e| e.into_inner()).take() {
            Some(rx) => Box::pin(UnboundedReceiverStream::new(rx)),
            None => Box::pin(tokio_stream::empty::<InboundMessage>()),
        }
    }

    async fn close(&self) -> Result<()> {
        // Aborting the poller drops its sender and ends the stream
        if let Some(handle) = self.poller.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        self.inbound_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.devices.lock().unwrap_or_else(|e| e.into_inner()).clear();
        Ok(())
    }

    fn transport_name(&self) -> &'static str {
        SPOOL_PROTOCOL
    }
}

impl Drop for SpoolTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.poller.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}

/// Poll the inboxes of every subscribed device until the receiver goes away
async fn poll_inbox(
    spool: SpoolDirectory,
    devices: Arc<Mutex<BTreeSet<String>>>,
    poll_interval: Duration,
    tx: mpsc::UnboundedSender<InboundMessage>,
) {
    tracing::info!(
        "Starting spool monitoring (root={}, interval={:?})",
        spool.root().display(),
        poll_interval
    );

    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let subscribed: Vec<String> = devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect();

        for device_id in subscribed {
            for topic in INBOUND_TOPICS {
                let paths = match list_documents(&spool.inbox(&device_id, topic)).await {
                    Ok(paths) => paths,
                    Err(e) => {
                        tracing::warn!("Failed to list {} inbox of {}: {}", topic, device_id, e);
                        continue;
                    }
                };
                for path in paths {
                    let payload = match fs::read(&path).await {
                        Ok(payload) => payload,
                        Err(e) => {
                            tracing::warn!("Failed to read {}: {}", path.display(), e);
                            continue;
                        }
                    };
                    if let Err(e) = fs::remove_file(&path).await {
                        tracing::warn!("Failed to consume {}: {}", path.display(), e);
                        continue;
                    }
                    if tx.send(InboundMessage::new(&device_id, *topic, payload)).is_err() {
                        tracing::debug!("Receiver dropped, stopping spool monitor");
                        return;
                    }
                }
            }
        }
    }
}

/// Factory for creating spool transports
#[derive(Debug, Clone)]
pub struct SpoolTransportFactory {
    poll_interval: Duration,
}

impl SpoolTransportFactory {
    pub fn new() -> Self {
        Self::with_interval(Duration::from_millis(DEFAULT_POLL_INTERVAL_MS))
    }

    pub fn with_interval(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }
}

impl Default for SpoolTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportFactory for SpoolTransportFactory {
    fn create(
        &self,
        device_id: &str,
        endpoint: &EndpointConfiguration,
    ) -> Result<Box<dyn Transport>> {
        if endpoint.protocol != SPOOL_PROTOCOL {
            return Err(Error::config(format!(
                "Invalid protocol for spool transport: {}",
                endpoint.protocol
            )));
        }
        if endpoint.hostname.is_empty() {
            return Err(Error::config("Spool transport needs a root directory"));
        }
        Ok(Box::new(SpoolTransport::with_interval(
            &endpoint.hostname,
            device_id,
            self.poll_interval,
        )))
    }
}

/// Register the spool transport with a registry
pub fn register(registry: &ProviderRegistry) {
    registry.register_transport(SPOOL_PROTOCOL, Box::new(SpoolTransportFactory::new()));
}
