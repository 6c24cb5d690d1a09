// # udmi-core
//
// Core library for the device side of the UDMI configuration/telemetry
// protocol.
//
// ## Architecture Overview
//
// This library provides the device engine and its collaborators:
// - **Transport**: Trait for the publish/subscribe connection to an endpoint
// - **ScanProvider**: Trait for discovery scans of one address family
// - **PersistentStore**: Trait for data that survives a restart
// - **MessageRecorder** / **MessageMigrator**: Document mirror and version translation
// - **DeviceEngine**: Core engine reconciling config into state for a device
//   and its proxies, with discovery scheduling and endpoint failover
// - **ProviderRegistry**: Plugin-based registry for transports and scanners
//
// ## Design Principles
//
// 1. **Separation of Concerns**: Protocol logic is separate from transports
// 2. **Sans-IO Components**: Discovery, failover and lifecycle decisions are
//    plain state machines driven by the engine
// 3. **Plugin-Based**: Transports are registered by protocol, no hard-coded if-else
// 4. **Library-First**: The daemon is a thin wrapper around this crate
// 5. **Idempotency**: Generations and signatures make repeated instructions no-ops

pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod record;
pub mod registry;
pub mod scan;
pub mod store;
pub mod traits;
pub mod transport;

// Re-export core types for convenience
pub use config::{DeviceConfig, DeviceOptions, EngineConfig, PersistenceConfig, RecordingConfig};
pub use engine::{Collaborators, DeviceEngine, EngineEvent, ExitReason, PublishOutcome};
pub use error::{Error, Result};
pub use model::{EndpointConfiguration, Entry, Level, State, SystemMode};
pub use registry::ProviderRegistry;
pub use store::{FilePersistentStore, MemoryPersistentStore};
pub use traits::{MessageMigrator, MessageRecorder, PersistentStore, ScanProvider, Transport};
