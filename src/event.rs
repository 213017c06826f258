//! Domain event streams and their published message form.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single domain event with an opaque JSON payload.
///
/// The payload convention matches the rest of the crate: the `event_type`
/// tag identifies the variant, `data` carries whatever the domain attaches
/// to it. Events are assigned a fresh v4 id at construction so downstream
/// consumers can deduplicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Globally unique event id.
    pub id: Uuid,
    /// Event type tag (e.g. `"Opened"`).
    pub event_type: String,
    /// Opaque JSON payload.
    pub data: serde_json::Value,
}

impl DomainEvent {
    /// Create an event with a freshly generated id.
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            data,
        }
    }
}

/// An atomic, ordered batch of events produced by one command against one
/// aggregate at one version.
///
/// The event store guarantees at most one stream per
/// `(aggregate_id, version)` and per `(aggregate_id, command_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEventStream {
    /// Id of the command that produced this stream.
    pub command_id: String,
    /// Id of the aggregate the stream belongs to.
    pub aggregate_id: String,
    /// Aggregate type name, resolvable through the type registry.
    pub aggregate_type: String,
    /// Aggregate version this stream commits (1 for creation).
    pub version: u64,
    /// The events, in the order the aggregate produced them.
    pub events: Vec<DomainEvent>,
    /// Opaque metadata propagated from the command.
    pub items: HashMap<String, String>,
}

impl DomainEventStream {
    /// Assemble a stream from its parts.
    pub fn new(
        command_id: impl Into<String>,
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        version: u64,
        events: Vec<DomainEvent>,
        items: HashMap<String, String>,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            version,
            events,
            items,
        }
    }
}

/// The published form of a committed stream.
///
/// Identical to the stream it was built from, except that its `items` map
/// is the stream's items merged with the originating command's items --
/// command items win on key collision, so per-command metadata always
/// reaches subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventStreamMessage {
    /// Id of the command that produced the stream.
    pub command_id: String,
    /// Id of the aggregate the stream belongs to.
    pub aggregate_id: String,
    /// Aggregate type name.
    pub aggregate_type: String,
    /// Aggregate version the stream committed.
    pub version: u64,
    /// The committed events, in order.
    pub events: Vec<DomainEvent>,
    /// Merged stream + command metadata.
    pub items: HashMap<String, String>,
}

impl EventStreamMessage {
    /// Build the published message for `stream`, merging `command_items`
    /// over the stream's own items.
    pub fn from_stream(stream: &DomainEventStream, command_items: &HashMap<String, String>) -> Self {
        let mut items = stream.items.clone();
        for (key, value) in command_items {
            items.insert(key.clone(), value.clone());
        }
        Self {
            command_id: stream.command_id.clone(),
            aggregate_id: stream.aggregate_id.clone(),
            aggregate_type: stream.aggregate_type.clone(),
            version: stream.version,
            events: stream.events.clone(),
            items,
        }
    }
}
