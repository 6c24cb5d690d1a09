//! Outgoing message kinds and their topic mapping

use serde::Serialize;
use std::collections::HashMap;

use super::events::{DiscoveryEvents, PointsetEvents, SystemEvents};
use super::state::State;
use crate::error::Result;

/// Inbound topic carrying config documents
pub const CONFIG_TOPIC: &str = "config";

/// Inbound, gateway-scoped topic carrying error reports
pub const ERRORS_TOPIC: &str = "errors";

/// Document kinds known to the version migrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    Config,
    State,
    SystemEvents,
    PointsetEvents,
    DiscoveryEvents,
}

/// Tag of an outgoing message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    State,
    SystemEvents,
    PointsetEvents,
    DiscoveryEvents,
}

impl MessageKind {
    pub fn document_kind(self) -> DocumentKind {
        match self {
            MessageKind::State => DocumentKind::State,
            MessageKind::SystemEvents => DocumentKind::SystemEvents,
            MessageKind::PointsetEvents => DocumentKind::PointsetEvents,
            MessageKind::DiscoveryEvents => DocumentKind::DiscoveryEvents,
        }
    }
}

/// Every message the device publishes
#[derive(Debug, Clone, PartialEq)]
pub enum OutgoingMessage {
    State(State),
    System(SystemEvents),
    Pointset(PointsetEvents),
    Discovery(DiscoveryEvents),
}

impl OutgoingMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            OutgoingMessage::State(_) => MessageKind::State,
            OutgoingMessage::System(_) => MessageKind::SystemEvents,
            OutgoingMessage::Pointset(_) => MessageKind::PointsetEvents,
            OutgoingMessage::Discovery(_) => MessageKind::DiscoveryEvents,
        }
    }

    /// JSON form of the message body
    pub fn to_value(&self) -> Result<serde_json::Value> {
        fn encode<T: Serialize>(body: &T) -> Result<serde_json::Value> {
            Ok(serde_json::to_value(body)?)
        }
        match self {
            OutgoingMessage::State(body) => encode(body),
            OutgoingMessage::System(body) => encode(body),
            OutgoingMessage::Pointset(body) => encode(body),
            OutgoingMessage::Discovery(body) => encode(body),
        }
    }
}

/// Topic suffix per outgoing message kind
///
/// Built once at startup and carried by the engine.
#[derive(Debug, Clone)]
pub struct TopicTable {
    suffixes: HashMap<MessageKind, String>,
}

impl TopicTable {
    pub fn new() -> Self {
        let suffixes = [
            (MessageKind::State, "state"),
            (MessageKind::SystemEvents, "events/system"),
            (MessageKind::PointsetEvents, "events/pointset"),
            (MessageKind::DiscoveryEvents, "events/discovery"),
        ]
        .into_iter()
        .map(|(kind, suffix)| (kind, suffix.to_string()))
        .collect();
        Self { suffixes }
    }

    /// Override the suffix used for one message kind
    pub fn with_suffix(mut self, kind: MessageKind, suffix: impl Into<String>) -> Self {
        self.suffixes.insert(kind, suffix.into());
        self
    }

    pub fn suffix(&self, kind: MessageKind) -> &str {
        self.suffixes.get(&kind).map(String::as_str).unwrap_or("events")
    }
}

impl Default for TopicTable {
    fn default() -> Self {
        Self::new()
    }
}
