//! Aggregate behavior seam and the startup-time type registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::AggregateError;
use crate::event::DomainEventStream;

/// A consistency boundary in the domain model.
///
/// The committing core drives aggregates through two state transitions:
/// [`accept_changes`](AggregateRoot::accept_changes) after a successful
/// append (finalizing the uncommitted changes at the committed version) and
/// [`replay_events`](AggregateRoot::replay_events) when rebuilding state
/// from persisted history.
///
/// # Contract
///
/// - `version` is the last *committed* version; an aggregate that has never
///   committed reports 0.
/// - `accept_changes(v)` must reject any `v != version + 1`.
/// - `replay_events` must be deterministic: the same streams in the same
///   order produce the same state.
pub trait AggregateRoot: Send {
    /// Unique id of this aggregate instance.
    fn unique_id(&self) -> &str;

    /// Last committed version (0 for a fresh instance).
    fn version(&self) -> u64;

    /// Aggregate type name, as registered in the [`AggregateTypeRegistry`].
    fn type_name(&self) -> &str;

    /// Finalize uncommitted changes at `new_version`.
    fn accept_changes(&mut self, new_version: u64) -> Result<(), AggregateError>;

    /// Rebuild state by folding persisted streams, in order.
    fn replay_events(&mut self, streams: &[DomainEventStream]);
}

/// Shared handle to an aggregate instance.
///
/// The committing context and the aggregate cache hold the same instance;
/// the mutex serializes the rare writes (accept/replay) against cache reads.
pub type SharedAggregate = Arc<Mutex<dyn AggregateRoot>>;

/// Factory closure that builds an empty aggregate instance for an id.
pub type AggregateFactory = Box<dyn Fn(&str) -> SharedAggregate + Send + Sync>;

/// Maps aggregate type names to construction factories.
///
/// Applications register every aggregate type at startup; the committing
/// core looks types up by name when it has to rebuild an aggregate from
/// persisted streams. This is the whole of "type resolution" -- there is no
/// runtime introspection.
#[derive(Default)]
pub struct AggregateTypeRegistry {
    factories: HashMap<String, AggregateFactory>,
}

impl AggregateTypeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for `type_name`, replacing any previous one.
    pub fn register<F>(&mut self, type_name: impl Into<String>, factory: F)
    where
        F: Fn(&str) -> SharedAggregate + Send + Sync + 'static,
    {
        self.factories.insert(type_name.into(), Box::new(factory));
    }

    /// Build a fresh aggregate of `type_name` with the given id.
    ///
    /// Returns `None` when the type name is not registered.
    pub fn create(&self, type_name: &str, aggregate_id: &str) -> Option<SharedAggregate> {
        self.factories.get(type_name).map(|f| f(aggregate_id))
    }

    /// Whether a factory is registered for `type_name`.
    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }
}

// Manual `Debug` because factories are closures.
impl std::fmt::Debug for AggregateTypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateTypeRegistry")
            .field("types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use std::sync::{Arc, Mutex};

    use super::{AggregateRoot, AggregateTypeRegistry, SharedAggregate};
    use crate::error::AggregateError;
    use crate::event::DomainEventStream;

    pub(crate) const FIXTURE_TYPE: &str = "fixture";

    /// Minimal aggregate used as a fixture across the crate's tests.
    #[derive(Debug)]
    pub(crate) struct FixtureAggregate {
        pub id: String,
        pub version: u64,
        /// Event types replayed into this instance, in order.
        pub replayed: Vec<String>,
    }

    impl FixtureAggregate {
        pub(crate) fn new(id: impl Into<String>, version: u64) -> Self {
            Self {
                id: id.into(),
                version,
                replayed: Vec::new(),
            }
        }

        pub(crate) fn shared(id: impl Into<String>, version: u64) -> SharedAggregate {
            Arc::new(Mutex::new(Self::new(id, version)))
        }
    }

    impl AggregateRoot for FixtureAggregate {
        fn unique_id(&self) -> &str {
            &self.id
        }

        fn version(&self) -> u64 {
            self.version
        }

        fn type_name(&self) -> &str {
            FIXTURE_TYPE
        }

        fn accept_changes(&mut self, new_version: u64) -> Result<(), AggregateError> {
            if new_version != self.version + 1 {
                return Err(AggregateError::VersionMismatch {
                    aggregate_id: self.id.clone(),
                    current: self.version,
                    accepted: new_version,
                });
            }
            self.version = new_version;
            Ok(())
        }

        fn replay_events(&mut self, streams: &[DomainEventStream]) {
            for stream in streams {
                self.version = stream.version;
                self.replayed
                    .extend(stream.events.iter().map(|e| e.event_type.clone()));
            }
        }
    }

    /// Registry with the fixture type pre-registered.
    pub(crate) fn fixture_registry() -> AggregateTypeRegistry {
        let mut registry = AggregateTypeRegistry::new();
        registry.register(FIXTURE_TYPE, |id| FixtureAggregate::shared(id, 0));
        registry
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::PoisonError;

    use super::test_fixtures::{FIXTURE_TYPE, FixtureAggregate, fixture_registry};
    use super::*;
    use crate::event::{DomainEvent, DomainEventStream};

    #[test]
    fn accept_changes_advances_version() {
        let mut aggregate = FixtureAggregate::new("a-1", 3);
        aggregate.accept_changes(4).expect("next version should be accepted");
        assert_eq!(aggregate.version(), 4);
    }

    #[test]
    fn accept_changes_rejects_version_gap() {
        let mut aggregate = FixtureAggregate::new("a-1", 3);
        let err = aggregate.accept_changes(6).expect_err("gap should be rejected");
        assert!(matches!(err, AggregateError::VersionMismatch { current: 3, accepted: 6, .. }));
        assert_eq!(aggregate.version(), 3, "version must be unchanged on rejection");
    }

    #[test]
    fn replay_events_folds_streams_in_order() {
        let mut aggregate = FixtureAggregate::new("a-1", 0);
        let streams = vec![
            DomainEventStream::new(
                "c-1",
                "a-1",
                FIXTURE_TYPE,
                1,
                vec![DomainEvent::new("Created", serde_json::Value::Null)],
                HashMap::new(),
            ),
            DomainEventStream::new(
                "c-2",
                "a-1",
                FIXTURE_TYPE,
                2,
                vec![DomainEvent::new("Renamed", serde_json::Value::Null)],
                HashMap::new(),
            ),
        ];

        aggregate.replay_events(&streams);

        assert_eq!(aggregate.version(), 2);
        assert_eq!(aggregate.replayed, vec!["Created", "Renamed"]);
    }

    #[test]
    fn registry_creates_registered_type() {
        let registry = fixture_registry();
        let aggregate = registry
            .create(FIXTURE_TYPE, "a-9")
            .expect("fixture type should be registered");
        let aggregate = aggregate.lock().unwrap_or_else(PoisonError::into_inner);
        assert_eq!(aggregate.unique_id(), "a-9");
        assert_eq!(aggregate.version(), 0);
    }

    #[test]
    fn registry_returns_none_for_unknown_type() {
        let registry = fixture_registry();
        assert!(registry.create("no-such-type", "a-1").is_none());
        assert!(!registry.contains("no-such-type"));
        assert!(registry.contains(FIXTURE_TYPE));
    }
}
