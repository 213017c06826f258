//! Downstream publication seam and an in-memory collecting double.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::error::PublishError;
use crate::event::EventStreamMessage;

/// Publishes committed stream messages to downstream subscribers.
///
/// The committing core republishes on crash recovery, so implementations
/// must be idempotent or tolerate duplicate publishes of the same message.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Deliver `message` downstream.
    async fn publish(&self, message: &EventStreamMessage) -> Result<(), PublishError>;
}

/// In-memory [`EventPublisher`] that collects every published message.
///
/// Useful in tests and embedded setups where "downstream" is the same
/// process.
#[derive(Debug, Default)]
pub struct MemoryEventPublisher {
    published: Mutex<Vec<EventStreamMessage>>,
}

impl MemoryEventPublisher {
    /// Create an empty publisher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything published so far, in publish order.
    pub fn published(&self) -> Vec<EventStreamMessage> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl EventPublisher for MemoryEventPublisher {
    async fn publish(&self, message: &EventStreamMessage) -> Result<(), PublishError> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::event::{DomainEvent, DomainEventStream};

    #[tokio::test]
    async fn publish_collects_messages_in_order() {
        let publisher = MemoryEventPublisher::new();
        for version in 1..=3u64 {
            let stream = DomainEventStream::new(
                format!("c-{version}"),
                "a-1",
                "fixture",
                version,
                vec![DomainEvent::new("Happened", serde_json::Value::Null)],
                HashMap::new(),
            );
            let message = EventStreamMessage::from_stream(&stream, &HashMap::new());
            publisher.publish(&message).await.expect("publish");
        }

        let published = publisher.published();
        assert_eq!(published.len(), 3);
        assert_eq!(
            published.iter().map(|m| m.version).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }
}
