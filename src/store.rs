//! Event store seam and the in-memory reference implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::event::DomainEventStream;

/// Outcome of appending a proposed stream.
///
/// These are semantic decisions, not errors: the committing state machine
/// branches on them. I/O failures travel separately as [`StoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    /// The stream is durable.
    Success,
    /// A stream already exists at `(aggregate_id, version)`.
    DuplicateEvent,
    /// A stream already exists for `(aggregate_id, command_id)` at some
    /// other version.
    DuplicateCommand,
}

/// Durable append-only log of event streams.
///
/// # Contract
///
/// - `append` decides atomically between its three outcomes and returns
///   `Success` only once the stream is durable.
/// - At most one stream exists per `(aggregate_id, version)` and per
///   `(aggregate_id, command_id)`.
/// - When a proposed stream collides on both keys at once (an exact
///   replay), the version collision wins and `DuplicateEvent` is reported;
///   `DuplicateCommand` is reserved for a command-id collision at a fresh
///   version. The recovery branches of the committing core depend on this
///   precedence.
/// - Implementations must be `Send + Sync`; the store is shared across all
///   committing lanes.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append a proposed stream, deciding its outcome atomically.
    async fn append(&self, stream: &DomainEventStream) -> Result<AppendResult, StoreError>;

    /// Look up the stream committed by `command_id` against `aggregate_id`.
    async fn find_by_command_id(
        &self,
        aggregate_id: &str,
        command_id: &str,
    ) -> Result<Option<DomainEventStream>, StoreError>;

    /// Look up the stream at `(aggregate_id, version)`.
    async fn find_by_version(
        &self,
        aggregate_id: &str,
        version: u64,
    ) -> Result<Option<DomainEventStream>, StoreError>;

    /// Load the streams for `aggregate_id` with versions in
    /// `from_version..=to_version`, in ascending version order.
    async fn load_streams(
        &self,
        aggregate_id: &str,
        from_version: u64,
        to_version: u64,
    ) -> Result<Vec<DomainEventStream>, StoreError>;
}

#[derive(Default)]
struct MemoryStoreInner {
    /// Streams per aggregate, keyed by version.
    streams: HashMap<String, BTreeMap<u64, DomainEventStream>>,
    /// `(aggregate_id, command_id)` -> committed version.
    command_index: HashMap<(String, String), u64>,
}

/// In-memory [`EventStore`] for tests and embedded use.
///
/// Enforces both uniqueness invariants under a single mutex, so the
/// three-way append decision is trivially atomic. "Durable before
/// returning `Success`" holds vacuously.
#[derive(Default)]
pub struct MemoryEventStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryEventStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryStoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of streams committed for `aggregate_id`.
    pub fn stream_count(&self, aggregate_id: &str) -> usize {
        self.lock().streams.get(aggregate_id).map_or(0, BTreeMap::len)
    }
}

impl std::fmt::Debug for MemoryEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("MemoryEventStore")
            .field("aggregates", &inner.streams.len())
            .field("streams", &inner.command_index.len())
            .finish()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, stream: &DomainEventStream) -> Result<AppendResult, StoreError> {
        let mut inner = self.lock();

        if let Some(versions) = inner.streams.get(&stream.aggregate_id) {
            if versions.contains_key(&stream.version) {
                return Ok(AppendResult::DuplicateEvent);
            }
        }
        let command_key = (stream.aggregate_id.clone(), stream.command_id.clone());
        if inner.command_index.contains_key(&command_key) {
            return Ok(AppendResult::DuplicateCommand);
        }

        inner
            .streams
            .entry(stream.aggregate_id.clone())
            .or_default()
            .insert(stream.version, stream.clone());
        inner.command_index.insert(command_key, stream.version);
        Ok(AppendResult::Success)
    }

    async fn find_by_command_id(
        &self,
        aggregate_id: &str,
        command_id: &str,
    ) -> Result<Option<DomainEventStream>, StoreError> {
        let inner = self.lock();
        let key = (aggregate_id.to_owned(), command_id.to_owned());
        let Some(version) = inner.command_index.get(&key) else {
            return Ok(None);
        };
        Ok(inner
            .streams
            .get(aggregate_id)
            .and_then(|versions| versions.get(version))
            .cloned())
    }

    async fn find_by_version(
        &self,
        aggregate_id: &str,
        version: u64,
    ) -> Result<Option<DomainEventStream>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .streams
            .get(aggregate_id)
            .and_then(|versions| versions.get(&version))
            .cloned())
    }

    async fn load_streams(
        &self,
        aggregate_id: &str,
        from_version: u64,
        to_version: u64,
    ) -> Result<Vec<DomainEventStream>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .streams
            .get(aggregate_id)
            .map(|versions| {
                versions
                    .range(from_version..=to_version)
                    .map(|(_, stream)| stream.clone())
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::event::DomainEvent;

    fn stream(command_id: &str, aggregate_id: &str, version: u64) -> DomainEventStream {
        DomainEventStream::new(
            command_id,
            aggregate_id,
            "fixture",
            version,
            vec![DomainEvent::new("Happened", serde_json::Value::Null)],
            HashMap::new(),
        )
    }

    #[tokio::test]
    async fn append_fresh_stream_succeeds() {
        let store = MemoryEventStore::new();
        let result = store.append(&stream("c-1", "a-1", 1)).await.expect("append");
        assert_eq!(result, AppendResult::Success);
        assert_eq!(store.stream_count("a-1"), 1);
    }

    #[tokio::test]
    async fn version_collision_reports_duplicate_event() {
        let store = MemoryEventStore::new();
        store.append(&stream("c-1", "a-1", 1)).await.expect("append");

        let result = store.append(&stream("c-2", "a-1", 1)).await.expect("append");

        assert_eq!(result, AppendResult::DuplicateEvent);
        assert_eq!(store.stream_count("a-1"), 1, "rejected stream must not be stored");
    }

    #[tokio::test]
    async fn exact_replay_reports_duplicate_event_not_duplicate_command() {
        // Both keys collide; version precedence lets the committing core's
        // first-version recovery branch re-fetch and compare command ids.
        let store = MemoryEventStore::new();
        store.append(&stream("c-1", "a-1", 1)).await.expect("append");

        let result = store.append(&stream("c-1", "a-1", 1)).await.expect("append");

        assert_eq!(result, AppendResult::DuplicateEvent);
    }

    #[tokio::test]
    async fn command_collision_at_fresh_version_reports_duplicate_command() {
        let store = MemoryEventStore::new();
        store.append(&stream("c-1", "a-1", 1)).await.expect("append");

        let result = store.append(&stream("c-1", "a-1", 2)).await.expect("append");

        assert_eq!(result, AppendResult::DuplicateCommand);
        assert_eq!(store.stream_count("a-1"), 1);
    }

    #[tokio::test]
    async fn same_version_on_other_aggregate_is_independent() {
        let store = MemoryEventStore::new();
        store.append(&stream("c-1", "a-1", 1)).await.expect("append");

        let result = store.append(&stream("c-2", "a-2", 1)).await.expect("append");

        assert_eq!(result, AppendResult::Success);
    }

    #[tokio::test]
    async fn find_by_command_id_returns_committed_stream() {
        let store = MemoryEventStore::new();
        let committed = stream("c-1", "a-1", 1);
        store.append(&committed).await.expect("append");

        let found = store
            .find_by_command_id("a-1", "c-1")
            .await
            .expect("find")
            .expect("stream should exist");
        assert_eq!(found, committed);

        let missing = store.find_by_command_id("a-1", "c-404").await.expect("find");
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn find_by_version_returns_committed_stream() {
        let store = MemoryEventStore::new();
        let committed = stream("c-1", "a-1", 1);
        store.append(&committed).await.expect("append");

        let found = store
            .find_by_version("a-1", 1)
            .await
            .expect("find")
            .expect("stream should exist");
        assert_eq!(found, committed);

        let missing = store.find_by_version("a-1", 2).await.expect("find");
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn load_streams_honors_the_version_range() {
        let store = MemoryEventStore::new();
        for version in 1..=4 {
            store
                .append(&stream(&format!("c-{version}"), "a-1", version))
                .await
                .expect("append");
        }

        let middle = store.load_streams("a-1", 2, 3).await.expect("load");
        assert_eq!(middle.len(), 2);
        assert_eq!(middle[0].version, 2);
        assert_eq!(middle[1].version, 3);

        let all = store.load_streams("a-1", 1, u64::MAX).await.expect("load");
        assert_eq!(all.len(), 4);

        let none = store.load_streams("a-404", 1, u64::MAX).await.expect("load");
        assert!(none.is_empty());
    }
}
