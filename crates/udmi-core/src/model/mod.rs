// # Protocol Documents
//
// Typed forms of the documents exchanged with the controller: the inbound
// Config, the outbound State and events, log entries and the endpoint
// descriptor carried in the blob-set.

pub mod config;
pub mod endpoint;
pub mod entry;
pub mod events;
pub mod message;
pub mod state;

pub use config::{
    BlobBlobsetConfig, BlobsetConfig, Config, DiscoveryConfig, FamilyDiscoveryConfig,
    GatewayConfig, IOT_ENDPOINT_CONFIG, PointsetConfig, ScanDepth, SystemConfig,
};
pub use endpoint::EndpointConfiguration;
pub use entry::{Entry, Level, category};
pub use events::{DiscoveryEvents, GatewayError, PointsetEvents, SystemEvents};
pub use message::{CONFIG_TOPIC, DocumentKind, ERRORS_TOPIC, MessageKind, OutgoingMessage, TopicTable};
pub use state::{
    BlobBlobsetState, BlobPhase, DiscoveryPhase, FamilyDiscoveryState, State, SystemMode,
};

/// Protocol version this engine speaks natively
pub const UDMI_VERSION: &str = "1.5.2";
