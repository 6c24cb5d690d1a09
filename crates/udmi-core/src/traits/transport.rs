// # Transport Trait
//
// Defines the publish/subscribe primitive the engine talks through.
//
// ## Implementations
//
// - In-process broker: `udmi_core::transport::MemoryTransport`
// - Directory spool: `udmi-transport-spool` crate
// - Future: MQTT client bindings
//
// ## Usage
//
// ```rust,ignore
// use udmi_core::Transport;
// use tokio_stream::StreamExt;
//
// #[tokio::main]
// async fn main() -> anyhow::Result<()> {
//     let transport = /* Transport implementation */;
//
//     transport.connect().await?;
//     transport.publish("AHU-1", "state", br#"{"system":{}}"#).await?;
//
//     let mut inbound = transport.watch();
//     while let Some(message) = inbound.next().await {
//         println!("{} <- {}", message.device_id, message.topic);
//     }
//
//     Ok(())
// }
// ```

use async_trait::async_trait;
use std::pin::Pin;
use tokio_stream::Stream;

use crate::model::EndpointConfiguration;

/// A message delivered by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Device the message is addressed to (the gateway or one of its proxies)
    pub device_id: String,
    /// Logical topic (`config`, `errors`)
    pub topic: String,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(device_id: impl Into<String>, topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            device_id: device_id.into(),
            topic: topic.into(),
            payload,
        }
    }
}

/// Trait for transport implementations
///
/// A transport is one connection to one endpoint. Topics are logical
/// (`state`, `events/system`, ...) and scoped by device id; how that maps
/// onto the wire is the implementation's business.
///
/// # Responsibilities
///
/// Transports move bytes. They must not retry, throttle or interpret
/// payloads: the engine owns publish timing, timeouts and rollback.
/// A failed `connect` must leave the transport closed.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection and subscribe the owning device
    async fn connect(&self) -> Result<(), crate::Error>;

    /// Subscribe an additional (proxied) device through this connection
    async fn attach(&self, device_id: &str) -> Result<(), crate::Error>;

    /// Publish a payload on a device-scoped topic
    ///
    /// Completes when the transport has accepted the message.
    async fn publish(&self, device_id: &str, topic: &str, payload: &[u8])
    -> Result<(), crate::Error>;

    /// Stream of inbound messages for every subscribed device
    ///
    /// The stream ends when the transport is closed.
    fn watch(&self) -> Pin<Box<dyn Stream<Item = InboundMessage> + Send + 'static>>;

    /// Close the connection; closing twice is not an error
    async fn close(&self) -> Result<(), crate::Error>;

    /// Transport name (for logging)
    fn transport_name(&self) -> &'static str;
}

/// Helper trait for constructing transports from an endpoint descriptor
pub trait TransportFactory: Send + Sync {
    /// Create an unconnected transport for `device_id` targeting `endpoint`
    fn create(
        &self,
        device_id: &str,
        endpoint: &EndpointConfiguration,
    ) -> Result<Box<dyn Transport>, crate::Error>;
}
