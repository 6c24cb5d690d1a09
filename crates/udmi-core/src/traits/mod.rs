//! Collaborator traits for the device engine
//!
//! This module defines the abstract interfaces the engine is composed from.
//!
//! - [`Transport`]: connect/publish/subscribe primitive
//! - [`ScanProvider`]: discovery scans for one address family
//! - [`PersistentStore`]: data that survives a restart
//! - [`MessageRecorder`]: offline mirror of exchanged documents
//! - [`MessageMigrator`]: cross-version document translation

pub mod message_recorder;
pub mod migrator;
pub mod persistent_store;
pub mod scan_provider;
pub mod transport;

pub use message_recorder::{Direction, MessageRecorder};
pub use migrator::{MessageMigrator, PassthroughMigrator};
pub use persistent_store::{PersistentData, PersistentStore};
pub use scan_provider::{DiscoveredDevice, ScanProvider};
pub use transport::{InboundMessage, Transport, TransportFactory};
