//! Thread-safe in-memory cache of aggregate snapshots.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::aggregate::{AggregateTypeRegistry, SharedAggregate};
use crate::error::{AggregateError, CacheRefreshError};
use crate::event::DomainEventStream;
use crate::store::EventStore;

/// Shared cache of in-memory aggregate instances, keyed by aggregate id.
///
/// All committing lanes read and write the cache concurrently. It is
/// best-effort: a missing or stale entry is repopulated from the event
/// store on the next load, so cache maintenance failures are logged by the
/// callers and never surfaced.
pub struct AggregateCache {
    aggregates: RwLock<HashMap<String, SharedAggregate>>,
    registry: Arc<AggregateTypeRegistry>,
    store: Arc<dyn EventStore>,
}

impl AggregateCache {
    /// Create an empty cache backed by `store` for refreshes and `registry`
    /// for rebuilding evicted aggregates.
    pub fn new(registry: Arc<AggregateTypeRegistry>, store: Arc<dyn EventStore>) -> Self {
        Self {
            aggregates: RwLock::new(HashMap::new()),
            registry,
            store,
        }
    }

    /// Look up the cached aggregate for `aggregate_id`.
    ///
    /// Returns `None` when the id is not cached or the cached instance is
    /// of a different type than `type_name`.
    pub fn get(&self, aggregate_id: &str, type_name: &str) -> Option<SharedAggregate> {
        let map = self
            .aggregates
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let aggregate = map.get(aggregate_id)?;
        let matches = {
            let guard = aggregate.lock().unwrap_or_else(PoisonError::into_inner);
            guard.type_name() == type_name
        };
        if matches { Some(aggregate.clone()) } else { None }
    }

    /// Cache `aggregate`, replacing any previous entry for its id.
    pub fn set(&self, aggregate: SharedAggregate) {
        let key = {
            let guard = aggregate.lock().unwrap_or_else(PoisonError::into_inner);
            guard.unique_id().to_owned()
        };
        self.aggregates
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, aggregate);
    }

    /// Number of cached aggregates.
    pub fn len(&self) -> usize {
        self.aggregates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bring the cached aggregate up to the event store's latest version.
    ///
    /// A cached instance catches up by replaying the streams past its
    /// current version; a missing instance is rebuilt from scratch through
    /// the type registry and cached. Used by the committing core before a
    /// concurrency-conflict retry, so the re-executed command sees fresh
    /// state.
    ///
    /// # Errors
    ///
    /// Returns [`CacheRefreshError::Aggregate`] when `type_name` has no
    /// registered factory, and [`CacheRefreshError::Store`] when loading
    /// the history fails.
    pub async fn refresh_from_event_store(
        &self,
        type_name: &str,
        aggregate_id: &str,
    ) -> Result<(), CacheRefreshError> {
        match self.get(aggregate_id, type_name) {
            Some(aggregate) => {
                let from_version = {
                    let guard = aggregate.lock().unwrap_or_else(PoisonError::into_inner);
                    guard.version() + 1
                };
                let streams = self
                    .store
                    .load_streams(aggregate_id, from_version, u64::MAX)
                    .await?;
                if !streams.is_empty() {
                    let mut guard = aggregate.lock().unwrap_or_else(PoisonError::into_inner);
                    guard.replay_events(&streams);
                }
                Ok(())
            }
            None => {
                let aggregate = self
                    .registry
                    .create(type_name, aggregate_id)
                    .ok_or_else(|| AggregateError::UnknownType(type_name.to_owned()))?;
                let streams = self.store.load_streams(aggregate_id, 1, u64::MAX).await?;
                {
                    let mut guard = aggregate.lock().unwrap_or_else(PoisonError::into_inner);
                    guard.replay_events(&streams);
                }
                self.set(aggregate);
                Ok(())
            }
        }
    }

    /// Recovery-path refresh: ensure the aggregate that produced `stream`
    /// is cached.
    ///
    /// A cache hit is left untouched -- the in-memory copy is at least as
    /// fresh as the recovered stream. A miss constructs a fresh instance,
    /// replays the single stream into it, and caches it.
    pub fn restore_from_stream(&self, stream: &DomainEventStream) -> Result<(), AggregateError> {
        if self.get(&stream.aggregate_id, &stream.aggregate_type).is_some() {
            return Ok(());
        }
        let aggregate = self
            .registry
            .create(&stream.aggregate_type, &stream.aggregate_id)
            .ok_or_else(|| AggregateError::UnknownType(stream.aggregate_type.clone()))?;
        {
            let mut guard = aggregate.lock().unwrap_or_else(PoisonError::into_inner);
            guard.replay_events(std::slice::from_ref(stream));
        }
        self.set(aggregate);
        Ok(())
    }
}

impl std::fmt::Debug for AggregateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateCache")
            .field("cached", &self.len())
            .finish()
    }
}
