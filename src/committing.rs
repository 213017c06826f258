//! The committing core: hash-routed serial lanes that drive proposed event
//! streams through append, cache refresh, and publication.
//!
//! [`EventCommitter::commit`] routes each [`EventCommittingContext`] to one
//! of N lanes by a stable hash of its aggregate id. A lane admits one
//! context at a time and holds its admission latch until that context
//! reaches a terminal state, so commits for any single aggregate are
//! strictly serialized while distinct aggregates proceed in parallel.
//!
//! Append outcomes branch four ways: success flows into cache refresh and
//! publication; a duplicate command or a duplicated first version recovers
//! the previously persisted stream (the crash-between-append-and-publish
//! case); a duplicated later version is an optimistic concurrency conflict
//! and sends the command back to the registered [`CommandHandler`] for
//! re-execution against refreshed state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::aggregate::{AggregateTypeRegistry, SharedAggregate};
use crate::cache::AggregateCache;
use crate::command::{CommandHandler, CommandResult, ProcessingCommand};
use crate::error::BuildError;
use crate::event::{DomainEventStream, EventStreamMessage};
use crate::publisher::EventPublisher;
use crate::retry::{self, RetryPolicy};
use crate::store::{AppendResult, EventStore};

/// Lanes created when the builder is not told otherwise.
pub const DEFAULT_LANE_COUNT: usize = 4;

/// An in-flight commit: the command, the aggregate instance that produced
/// the proposal, and the proposed stream itself.
///
/// Owned exclusively by one lane from admission to terminal completion.
pub struct EventCommittingContext {
    /// The command whose execution produced the stream.
    pub processing_command: Arc<ProcessingCommand>,
    /// The in-memory aggregate carrying the uncommitted changes.
    pub aggregate_root: SharedAggregate,
    /// The proposed stream.
    pub event_stream: DomainEventStream,
}

impl std::fmt::Debug for EventCommittingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventCommittingContext")
            .field("command", &self.processing_command.message)
            .field("aggregate_id", &self.event_stream.aggregate_id)
            .field("version", &self.event_stream.version)
            .finish()
    }
}

/// One serial partition of the committing pipeline.
///
/// `busy` is an admission token, not a critical-section lock: it is taken
/// when a context is dequeued and held until that context reaches a
/// terminal state, across every await in between.
struct CommitLane {
    queue: Mutex<VecDeque<EventCommittingContext>>,
    busy: AtomicBool,
}

impl CommitLane {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            busy: AtomicBool::new(false),
        }
    }

    fn enqueue(&self, ctx: EventCommittingContext) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(ctx);
    }

    fn pop(&self) -> Option<EventCommittingContext> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn queue_is_empty(&self) -> bool {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    fn try_acquire(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn release(&self) {
        self.busy.store(false, Ordering::Release);
    }

    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Stable 32-bit hash used for lane routing.
///
/// DJB-style accumulator seeded at 23: `h = (h << 5) - h + codepoint` in
/// wrapping `i32` arithmetic, absolute value taken at the end. The exact
/// shape matters less than the guarantee: the same aggregate id routes to
/// the same lane in every process, restart included.
pub(crate) fn stable_hash(value: &str) -> u32 {
    let mut hash: i32 = 23;
    for codepoint in value.chars() {
        hash = hash
            .wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(codepoint as i32);
    }
    hash.unsigned_abs()
}

/// Commits proposed event streams: durable append, aggregate cache refresh,
/// and downstream publication, with per-aggregate serial ordering.
///
/// `Clone` is cheap -- all clones share the same lanes, cache, and
/// collaborators.
#[derive(Clone)]
pub struct EventCommitter {
    lanes: Arc<Vec<CommitLane>>,
    store: Arc<dyn EventStore>,
    publisher: Arc<dyn EventPublisher>,
    cache: Arc<AggregateCache>,
    handler: Arc<RwLock<Option<Arc<dyn CommandHandler>>>>,
    retry_policy: RetryPolicy,
}

impl std::fmt::Debug for EventCommitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventCommitter")
            .field("lane_count", &self.lanes.len())
            .field("retry_policy", &self.retry_policy)
            .finish()
    }
}

impl EventCommitter {
    /// Start building a committer over the given collaborators.
    pub fn builder(
        store: Arc<dyn EventStore>,
        publisher: Arc<dyn EventPublisher>,
        registry: Arc<AggregateTypeRegistry>,
    ) -> EventCommitterBuilder {
        EventCommitterBuilder {
            store,
            publisher,
            registry,
            lane_count: DEFAULT_LANE_COUNT,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Wire the command handler used for concurrency-conflict retries.
    ///
    /// Late-bound because the handler typically depends on the committer;
    /// committing a conflicting stream before a handler is registered fails
    /// the command instead of retrying it.
    pub fn set_command_handler(&self, handler: Arc<dyn CommandHandler>) {
        *self
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// The shared aggregate cache.
    pub fn cache(&self) -> Arc<AggregateCache> {
        self.cache.clone()
    }

    /// Number of committing lanes.
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Whether the lane responsible for `aggregate_id` currently holds a
    /// context in flight.
    pub fn is_lane_busy(&self, aggregate_id: &str) -> bool {
        self.lanes[self.lane_index(aggregate_id)].is_busy()
    }

    fn lane_index(&self, aggregate_id: &str) -> usize {
        stable_hash(aggregate_id) as usize % self.lanes.len()
    }

    /// Commit a proposed event stream.
    ///
    /// Routes the context to its aggregate's lane and returns once it is
    /// admitted or queued; the terminal [`CommandResult`] is delivered
    /// through the processing command's sink.
    ///
    /// A context whose command has a nonzero concurrency-retry count is the
    /// re-execution of a conflicted attempt. That attempt parked the lane
    /// without releasing it, so the retried context already owns the slot
    /// and is driven immediately -- ahead of every queued context for the
    /// aggregate, which is what keeps the retry inside the aggregate's
    /// serial order.
    pub async fn commit(&self, ctx: EventCommittingContext) {
        if ctx.processing_command.concurrent_retried_count() > 0 {
            self.drive(ctx).await;
            return;
        }
        let index = self.lane_index(&ctx.event_stream.aggregate_id);
        self.lanes[index].enqueue(ctx);
        self.admit_next(index);
    }

    /// Publish an already-persisted stream and complete its command.
    ///
    /// This is the entry point for flows that recover or replay a stream
    /// outside [`commit`](Self::commit) -- e.g. a command pipeline that
    /// found the stream already durable. Pass `admit_next = true` only when
    /// the calling flow holds the aggregate's lane slot; otherwise the
    /// lane latch of an unrelated in-flight context would be released.
    ///
    /// A terminal publish failure completes the command as failed and
    /// leaves the stream durable but unpublished; no background
    /// republisher exists.
    pub async fn publish_stream(
        &self,
        command: Arc<ProcessingCommand>,
        stream: DomainEventStream,
        admit_next: bool,
    ) {
        let message = EventStreamMessage::from_stream(&stream, &command.items);
        self.publish_and_complete(command, message, admit_next).await;
    }

    /// Lane admission loop. Runs until the slot is owned by someone (this
    /// call or another) or the queue is verifiably empty.
    fn admit_next(&self, lane_index: usize) {
        let lane = &self.lanes[lane_index];
        loop {
            if !lane.try_acquire() {
                // Another caller owns the slot; its completion path will
                // re-enter this loop.
                return;
            }
            if let Some(ctx) = lane.pop() {
                let committer = self.clone();
                tokio::spawn(async move { committer.drive(ctx).await });
                // The slot stays held until `ctx` reaches a terminal state.
                return;
            }
            lane.release();
            if lane.queue_is_empty() {
                return;
            }
            // A producer enqueued between the pop and the release; loop so
            // the enqueue is not lost.
        }
    }

    /// Drive one context through the commit state machine.
    async fn drive(&self, ctx: EventCommittingContext) {
        let aggregate_id = ctx.event_stream.aggregate_id.clone();
        let command_id = ctx.event_stream.command_id.clone();
        let version = ctx.event_stream.version;

        let append = retry::execute(
            "append",
            &self.retry_policy,
            || format!("aggregate={aggregate_id} command={command_id} version={version}"),
            || self.store.append(&ctx.event_stream),
        )
        .await;

        match append {
            Ok(AppendResult::Success) => {
                tracing::debug!(
                    aggregate_id = %aggregate_id,
                    command_id = %command_id,
                    version,
                    "event stream appended"
                );
                self.refresh_cache_after_commit(&ctx);
                let message = EventStreamMessage::from_stream(
                    &ctx.event_stream,
                    &ctx.processing_command.items,
                );
                self.publish_and_complete(ctx.processing_command.clone(), message, true)
                    .await;
            }
            Ok(AppendResult::DuplicateCommand) => self.recover_from_duplicate_command(ctx).await,
            Ok(AppendResult::DuplicateEvent) if version == 1 => {
                self.recover_from_first_version_duplication(ctx).await;
            }
            Ok(AppendResult::DuplicateEvent) => self.retry_concurrent_command(ctx).await,
            Err(error_message) => {
                tracing::error!(
                    aggregate_id = %aggregate_id,
                    command_id = %command_id,
                    error = %error_message,
                    "event stream append failed"
                );
                self.complete_context(
                    &ctx,
                    CommandResult::failed(command_id, aggregate_id, error_message),
                    true,
                );
            }
        }
    }

    /// The store already holds a stream for this `(aggregate, command)`:
    /// an earlier attempt appended it and crashed before publishing.
    /// Reconstruct the missing post-append steps from the persisted stream.
    async fn recover_from_duplicate_command(&self, ctx: EventCommittingContext) {
        let aggregate_id = ctx.event_stream.aggregate_id.clone();
        let command_id = ctx.processing_command.message.id.clone();

        let found = retry::execute(
            "find_by_command_id",
            &self.retry_policy,
            || format!("aggregate={aggregate_id} command={command_id}"),
            || self.store.find_by_command_id(&aggregate_id, &command_id),
        )
        .await;

        match found {
            Ok(Some(existing)) => {
                tracing::info!(
                    aggregate_id = %aggregate_id,
                    command_id = %command_id,
                    version = existing.version,
                    "command already committed, republishing the persisted stream"
                );
                self.refresh_cache_from_stream(&existing);
                let message =
                    EventStreamMessage::from_stream(&existing, &ctx.processing_command.items);
                self.publish_and_complete(ctx.processing_command.clone(), message, true)
                    .await;
            }
            Ok(None) => {
                tracing::error!(
                    aggregate_id = %aggregate_id,
                    command_id = %command_id,
                    "duplicate command reported but the persisted stream was not found"
                );
                self.complete_context(
                    &ctx,
                    CommandResult::failed(command_id, aggregate_id, "Duplicate command execution."),
                    true,
                );
            }
            Err(error_message) => {
                self.complete_context(
                    &ctx,
                    CommandResult::failed(command_id, aggregate_id, error_message),
                    true,
                );
            }
        }
    }

    /// A version-1 append collided. Either this is the same creation
    /// replayed after a crash (recover it) or two different commands both
    /// tried to create the aggregate (fail the later one).
    async fn recover_from_first_version_duplication(&self, ctx: EventCommittingContext) {
        let aggregate_id = ctx.event_stream.aggregate_id.clone();
        let command_id = ctx.processing_command.message.id.clone();

        let found = retry::execute(
            "find_by_version",
            &self.retry_policy,
            || format!("aggregate={aggregate_id} version=1"),
            || self.store.find_by_version(&aggregate_id, 1),
        )
        .await;

        match found {
            Ok(Some(existing)) if existing.command_id == command_id => {
                tracing::info!(
                    aggregate_id = %aggregate_id,
                    command_id = %command_id,
                    "creation already committed, republishing the persisted stream"
                );
                self.refresh_cache_from_stream(&existing);
                let message =
                    EventStreamMessage::from_stream(&existing, &ctx.processing_command.items);
                self.publish_and_complete(ctx.processing_command.clone(), message, true)
                    .await;
            }
            Ok(Some(existing)) => {
                tracing::error!(
                    aggregate_id = %aggregate_id,
                    command_id = %command_id,
                    existing_command_id = %existing.command_id,
                    "aggregate was already created by a different command"
                );
                self.complete_context(
                    &ctx,
                    CommandResult::failed(command_id, aggregate_id, "Duplicate aggregate creation."),
                    true,
                );
            }
            Ok(None) => {
                tracing::error!(
                    aggregate_id = %aggregate_id,
                    command_id = %command_id,
                    "duplicate creation reported but the existing stream was not found"
                );
                self.complete_context(
                    &ctx,
                    CommandResult::failed(
                        command_id,
                        aggregate_id,
                        "Duplicate aggregate creation, but the existing event stream was not found.",
                    ),
                    true,
                );
            }
            Err(error_message) => {
                self.complete_context(
                    &ctx,
                    CommandResult::failed(command_id, aggregate_id, error_message),
                    true,
                );
            }
        }
    }

    /// Optimistic concurrency conflict: another command committed this
    /// version first. Refresh the aggregate from the store and hand the
    /// command back for re-execution. No result is delivered for this
    /// attempt and the lane is intentionally left latched -- the retried
    /// attempt's terminal path releases it.
    async fn retry_concurrent_command(&self, ctx: EventCommittingContext) {
        let stream = &ctx.event_stream;
        if let Err(error) = self
            .cache
            .refresh_from_event_store(&stream.aggregate_type, &stream.aggregate_id)
            .await
        {
            tracing::error!(
                aggregate_id = %stream.aggregate_id,
                aggregate_type = %stream.aggregate_type,
                error = %error,
                "failed to refresh aggregate before concurrency retry"
            );
        }

        let command = ctx.processing_command.clone();
        let retried_count = command.increment_concurrent_retried_count();
        command.execute_context.clear();

        let handler = {
            let guard = self.handler.read().unwrap_or_else(PoisonError::into_inner);
            guard.as_ref().map(Arc::clone)
        };
        match handler {
            Some(handler) => {
                tracing::info!(
                    aggregate_id = %stream.aggregate_id,
                    command_id = %command.message.id,
                    retried_count,
                    "concurrency conflict, retrying command against refreshed state"
                );
                tokio::spawn(async move { handler.handle(command).await });
            }
            None => {
                tracing::error!(
                    aggregate_id = %stream.aggregate_id,
                    command_id = %command.message.id,
                    "concurrency conflict but no command handler is registered"
                );
                self.complete_context(
                    &ctx,
                    CommandResult::failed(
                        command.message.id.clone(),
                        stream.aggregate_id.clone(),
                        "No command handler registered for concurrency conflict retry.",
                    ),
                    true,
                );
            }
        }
    }

    /// Finalize the context's aggregate at the committed version and cache
    /// it. Best-effort: the stream is already durable, so failures are
    /// logged and swallowed and the cache repopulates on the next load.
    fn refresh_cache_after_commit(&self, ctx: &EventCommittingContext) {
        let accepted = {
            let mut aggregate = ctx
                .aggregate_root
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            aggregate.accept_changes(ctx.event_stream.version)
        };
        match accepted {
            Ok(()) => self.cache.set(ctx.aggregate_root.clone()),
            Err(error) => {
                tracing::error!(
                    aggregate_id = %ctx.event_stream.aggregate_id,
                    error = %error,
                    "committed changes rejected by the aggregate; cache not refreshed"
                );
            }
        }
    }

    /// Recovery-path cache refresh from a persisted stream. Best-effort.
    fn refresh_cache_from_stream(&self, stream: &DomainEventStream) {
        if let Err(error) = self.cache.restore_from_stream(stream) {
            tracing::error!(
                aggregate_id = %stream.aggregate_id,
                aggregate_type = %stream.aggregate_type,
                error = %error,
                "failed to restore the aggregate cache from the recovered stream"
            );
        }
    }

    /// Publish `message` through the retry executor and complete the
    /// command with the terminal outcome.
    async fn publish_and_complete(
        &self,
        command: Arc<ProcessingCommand>,
        message: EventStreamMessage,
        admit_next: bool,
    ) {
        let outcome = retry::execute(
            "publish",
            &self.retry_policy,
            || {
                format!(
                    "aggregate={} command={} version={}",
                    message.aggregate_id, message.command_id, message.version
                )
            },
            || self.publisher.publish(&message),
        )
        .await;

        let result = match outcome {
            Ok(()) => CommandResult::succeeded(
                message.command_id.clone(),
                message.aggregate_id.clone(),
                command.execute_context.result(),
            ),
            Err(error_message) => {
                tracing::error!(
                    aggregate_id = %message.aggregate_id,
                    command_id = %message.command_id,
                    error = %error_message,
                    "publish failed; the stream is durable but unpublished"
                );
                CommandResult::failed(
                    message.command_id.clone(),
                    message.aggregate_id.clone(),
                    error_message,
                )
            }
        };
        self.notify_command_executed(&command, &message.aggregate_id, result, admit_next);
    }

    fn complete_context(
        &self,
        ctx: &EventCommittingContext,
        result: CommandResult,
        admit_next: bool,
    ) {
        self.notify_command_executed(
            &ctx.processing_command,
            &ctx.event_stream.aggregate_id,
            result,
            admit_next,
        );
    }

    /// Deliver the terminal result, then (when this flow holds the lane
    /// slot) release the latch and admit the next queued context.
    fn notify_command_executed(
        &self,
        command: &ProcessingCommand,
        aggregate_id: &str,
        result: CommandResult,
        admit_next: bool,
    ) {
        command.complete(result);
        if admit_next {
            let index = self.lane_index(aggregate_id);
            self.lanes[index].release();
            self.admit_next(index);
        }
    }
}

/// Builder for [`EventCommitter`].
///
/// Created via [`EventCommitter::builder`]; lane count and retry policy
/// are optional, everything else is taken at construction.
pub struct EventCommitterBuilder {
    store: Arc<dyn EventStore>,
    publisher: Arc<dyn EventPublisher>,
    registry: Arc<AggregateTypeRegistry>,
    lane_count: usize,
    retry_policy: RetryPolicy,
}

impl EventCommitterBuilder {
    /// Number of serial commit lanes. Must be at least 1.
    ///
    /// More lanes mean more inter-aggregate parallelism; commits for one
    /// aggregate are serialized regardless.
    pub fn lane_count(mut self, lane_count: usize) -> Self {
        self.lane_count = lane_count;
        self
    }

    /// Retry budget and backoff for store and publisher I/O.
    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Finalize the committer.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::ZeroLanes`] when the lane count is 0.
    pub fn build(self) -> Result<EventCommitter, BuildError> {
        if self.lane_count == 0 {
            return Err(BuildError::ZeroLanes);
        }
        let lanes = (0..self.lane_count).map(|_| CommitLane::new()).collect();
        let cache = Arc::new(AggregateCache::new(self.registry, self.store.clone()));
        Ok(EventCommitter {
            lanes: Arc::new(lanes),
            store: self.store,
            publisher: self.publisher,
            cache,
            handler: Arc::new(RwLock::new(None)),
            retry_policy: self.retry_policy,
        })
    }
}
