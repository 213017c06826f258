//! Crate-level error types for the committing pipeline.

use crate::retry::Retryable;

/// Error returned by [`EventStore`](crate::EventStore) operations.
///
/// Semantic append outcomes (`DuplicateEvent`, `DuplicateCommand`) are not
/// errors -- they are variants of [`AppendResult`](crate::AppendResult).
/// This type covers only genuine failures of the store itself.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Transient I/O failure (connection loss, timeout, backend overload).
    ///
    /// Retried by the committing core until the retry budget is exhausted.
    #[error("event store I/O failure: {0}")]
    Io(String),

    /// Stored or proposed stream data could not be (de)serialized.
    ///
    /// Never retried: the same bytes will fail the same way every time.
    #[error("event stream data corrupt: {0}")]
    Corrupt(String),
}

impl Retryable for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io(_))
    }
}

/// Error returned by [`EventPublisher`](crate::EventPublisher).
#[derive(Debug, Clone, thiserror::Error)]
pub enum PublishError {
    /// Transient transport failure while delivering the message downstream.
    #[error("event publish transport failure: {0}")]
    Transport(String),

    /// The message could not be encoded for the downstream transport.
    ///
    /// Never retried.
    #[error("event stream message could not be encoded: {0}")]
    Encode(String),
}

impl Retryable for PublishError {
    fn is_transient(&self) -> bool {
        matches!(self, PublishError::Transport(_))
    }
}

/// Error raised by aggregate state transitions driven by the cache refreshers.
///
/// These never reach the caller of the committing core: cache maintenance is
/// best-effort, so the core logs them and moves on.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AggregateError {
    /// `accept_changes` was asked to finalize a version that does not follow
    /// the aggregate's current version.
    #[error(
        "aggregate {aggregate_id} is at version {current}, cannot accept changes at version {accepted}"
    )]
    VersionMismatch {
        /// The aggregate whose versions disagree.
        aggregate_id: String,
        /// The version the in-memory instance is at.
        current: u64,
        /// The version the committed stream carries.
        accepted: u64,
    },

    /// No factory is registered for the aggregate type name.
    #[error("no aggregate factory registered for type '{0}'")]
    UnknownType(String),
}

/// Error from [`AggregateCache::refresh_from_event_store`](crate::AggregateCache::refresh_from_event_store).
#[derive(Debug, thiserror::Error)]
pub enum CacheRefreshError {
    /// Loading the aggregate's history failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The aggregate could not be rebuilt (e.g. unknown type name).
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

/// Error returned by [`EventCommitterBuilder::build`](crate::EventCommitterBuilder::build).
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// The configured lane count was zero.
    #[error("lane count must be at least 1")]
    ZeroLanes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_io_is_transient() {
        assert!(StoreError::Io("connection reset".into()).is_transient());
    }

    #[test]
    fn store_corrupt_is_terminal() {
        assert!(!StoreError::Corrupt("bad json".into()).is_transient());
    }

    #[test]
    fn publish_transport_is_transient() {
        assert!(PublishError::Transport("broker down".into()).is_transient());
        assert!(!PublishError::Encode("bad payload".into()).is_transient());
    }

    #[test]
    fn version_mismatch_names_the_versions() {
        let err = AggregateError::VersionMismatch {
            aggregate_id: "a-1".into(),
            current: 3,
            accepted: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("a-1"), "message should name the aggregate: {msg}");
        assert!(msg.contains('3') && msg.contains('5'), "message should name both versions: {msg}");
    }

    // Verify `Send + Sync` bounds so errors can cross task boundaries.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<StoreError>();
            assert_send_sync::<PublishError>();
            assert_send_sync::<AggregateError>();
            assert_send_sync::<CacheRefreshError>();
        }
    };
}
