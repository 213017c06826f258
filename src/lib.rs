//! Partitioned event-committing core for event-sourced applications.
//!
//! `eventlane` takes the in-memory result of a command -- a proposed
//! [`DomainEventStream`] for one aggregate -- and drives it to its terminal
//! state: durable append to an [`EventStore`], refresh of the shared
//! [`AggregateCache`], publication through an [`EventPublisher`], and
//! delivery of exactly one [`CommandResult`] to the upstream pipeline.
//!
//! Commits are routed by a stable hash of the aggregate id onto a fixed
//! set of serial lanes: all commits for one aggregate are strictly
//! ordered, while distinct aggregates proceed in parallel. The committer
//! absorbs the failure modes that make this pipeline hard -- duplicate
//! commands and duplicate creations left behind by a crash between append
//! and publish, optimistic concurrency conflicts (retried automatically
//! against refreshed state), and transient store or publisher I/O faults
//! (retried with bounded exponential backoff).
//!
//! # Key Types
//!
//! | Type | Role |
//! |------|------|
//! | [`EventCommitter`] | Routes, serializes, and drives commits to completion |
//! | [`EventCommittingContext`] | One in-flight commit: command + aggregate + proposed stream |
//! | [`EventStore`] / [`MemoryEventStore`] | Durable append seam and its in-memory reference |
//! | [`EventPublisher`] / [`MemoryEventPublisher`] | Downstream publication seam and collecting double |
//! | [`AggregateCache`] | Shared in-memory aggregate snapshots with store-backed refresh |
//! | [`AggregateTypeRegistry`] | Startup-time name-to-factory registry for rebuilding aggregates |
//! | [`RetryPolicy`] | Retry budget and backoff for store and publisher I/O |
//!
//! # Quick Start
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::{Arc, Mutex};
//!
//! use eventlane::{
//!     AggregateError, AggregateRoot, AggregateTypeRegistry, CommandExecuteContext,
//!     CommandMessage, CommandResult, CommandSink, DomainEvent, DomainEventStream,
//!     EventCommitter, EventCommittingContext, MemoryEventPublisher, MemoryEventStore,
//!     ProcessingCommand,
//! };
//!
//! // 1. Define an aggregate.
//! struct Account {
//!     id: String,
//!     version: u64,
//! }
//!
//! impl AggregateRoot for Account {
//!     fn unique_id(&self) -> &str {
//!         &self.id
//!     }
//!     fn version(&self) -> u64 {
//!         self.version
//!     }
//!     fn type_name(&self) -> &str {
//!         "account"
//!     }
//!     fn accept_changes(&mut self, new_version: u64) -> Result<(), AggregateError> {
//!         self.version = new_version;
//!         Ok(())
//!     }
//!     fn replay_events(&mut self, streams: &[DomainEventStream]) {
//!         if let Some(last) = streams.last() {
//!             self.version = last.version;
//!         }
//!     }
//! }
//! # struct NoopSink;
//! # impl CommandSink for NoopSink {
//! #     fn complete(&self, _result: CommandResult) {}
//! # }
//! # struct NoopExecuteContext;
//! # impl CommandExecuteContext for NoopExecuteContext {
//! #     fn clear(&self) {}
//! #     fn result(&self) -> Option<String> { None }
//! # }
//!
//! # async fn run() {
//! // 2. Register aggregate types and build the committer.
//! let mut registry = AggregateTypeRegistry::new();
//! registry.register("account", |id| {
//!     Arc::new(Mutex::new(Account { id: id.to_owned(), version: 0 }))
//! });
//! let committer = EventCommitter::builder(
//!     Arc::new(MemoryEventStore::new()),
//!     Arc::new(MemoryEventPublisher::new()),
//!     Arc::new(registry),
//! )
//! .build()
//! .expect("valid configuration");
//!
//! // 3. Commit a proposed stream; the result arrives through the sink.
//! let command = Arc::new(ProcessingCommand::new(
//!     CommandMessage { id: "cmd-1".into(), aggregate_root_id: "acct-1".into() },
//!     HashMap::new(),
//!     Arc::new(NoopExecuteContext),
//!     Arc::new(NoopSink),
//! ));
//! let stream = DomainEventStream::new(
//!     "cmd-1",
//!     "acct-1",
//!     "account",
//!     1,
//!     vec![DomainEvent::new("Opened", serde_json::json!({ "balance": 0 }))],
//!     HashMap::new(),
//! );
//! let aggregate = Arc::new(Mutex::new(Account { id: "acct-1".into(), version: 0 }));
//! committer
//!     .commit(EventCommittingContext {
//!         processing_command: command,
//!         aggregate_root: aggregate,
//!         event_stream: stream,
//!     })
//!     .await;
//! # }
//! ```

mod aggregate;
pub use aggregate::{AggregateFactory, AggregateRoot, AggregateTypeRegistry, SharedAggregate};
mod cache;
pub use cache::AggregateCache;
mod command;
pub use command::{
    CommandExecuteContext, CommandHandler, CommandMessage, CommandResult, CommandSink,
    CommandStatus, ProcessingCommand,
};
mod committing;
pub use committing::{
    DEFAULT_LANE_COUNT, EventCommitter, EventCommitterBuilder, EventCommittingContext,
};
mod error;
pub use error::{AggregateError, BuildError, CacheRefreshError, PublishError, StoreError};
mod event;
pub use event::{DomainEvent, DomainEventStream, EventStreamMessage};
mod publisher;
pub use publisher::{EventPublisher, MemoryEventPublisher};
mod retry;
pub use retry::{RetryPolicy, Retryable};
mod store;
pub use store::{AppendResult, EventStore, MemoryEventStore};
