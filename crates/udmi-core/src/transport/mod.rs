// # Transport Implementations
//
// Network transports live in their own crates; this module only carries
// the in-process broker used for tests and embedding.

pub mod memory;

pub use memory::{MemoryBroker, MemoryTransport, MemoryTransportFactory, PublishedMessage};
