//! Processing-command wrapper, terminal results, and the upstream seams the
//! committing core completes into.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

/// Identity of a client-issued command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMessage {
    /// Globally unique command id.
    pub id: String,
    /// Id of the aggregate the command targets.
    pub aggregate_root_id: String,
}

/// Terminal status of one processing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// The command's events are durable and published.
    Succeeded,
    /// The attempt ended with an error; `CommandResult::result` carries the
    /// error message.
    Failed,
}

/// The terminal result delivered to the upstream command pipeline.
///
/// Exactly one result is delivered per processing attempt. The `result`
/// field carries the application payload on success and the error message
/// on failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Outcome of the attempt.
    pub status: CommandStatus,
    /// Id of the completed command.
    pub command_id: String,
    /// Id of the aggregate the command targeted.
    pub aggregate_id: String,
    /// Application payload (success) or error message (failure).
    pub result: Option<String>,
    /// Optional media/type tag describing `result`.
    pub result_type: Option<String>,
}

impl CommandResult {
    /// Build a success result carrying an optional application payload.
    pub fn succeeded(
        command_id: impl Into<String>,
        aggregate_id: impl Into<String>,
        result: Option<String>,
    ) -> Self {
        Self {
            status: CommandStatus::Succeeded,
            command_id: command_id.into(),
            aggregate_id: aggregate_id.into(),
            result,
            result_type: None,
        }
    }

    /// Build a failure result carrying an error message.
    pub fn failed(
        command_id: impl Into<String>,
        aggregate_id: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            status: CommandStatus::Failed,
            command_id: command_id.into(),
            aggregate_id: aggregate_id.into(),
            result: Some(error_message.into()),
            result_type: None,
        }
    }

    /// Tag the result payload with a type name.
    pub fn with_result_type(mut self, result_type: impl Into<String>) -> Self {
        self.result_type = Some(result_type.into());
        self
    }
}

/// Mutable per-attempt execution state owned by the upstream pipeline.
///
/// The committing core touches it in exactly two places: it reads the
/// application result when building a success `CommandResult`, and it
/// clears the state before handing a conflicted command back for
/// re-execution.
pub trait CommandExecuteContext: Send + Sync {
    /// Discard all uncommitted execution state so the command can be
    /// re-executed from scratch.
    fn clear(&self);

    /// The application-level result payload captured during execution.
    fn result(&self) -> Option<String>;
}

/// Completion sink for one processing attempt.
///
/// `complete` is called exactly once per attempt; on the
/// concurrency-conflict retry path the conflicted attempt delivers nothing
/// and the retried attempt's sink fires instead.
pub trait CommandSink: Send + Sync {
    /// Deliver the terminal result to the upstream pipeline.
    fn complete(&self, result: CommandResult);
}

/// Re-executes a command against refreshed aggregate state.
///
/// Invoked by the committing core when an append hits an optimistic
/// concurrency conflict. The handler owns the full execute-and-commit
/// cycle for the retried attempt.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Re-execute `command`. The retried attempt is responsible for
    /// delivering the command's terminal result.
    async fn handle(&self, command: Arc<ProcessingCommand>);
}

/// A command in flight through the pipeline.
///
/// Owned by the upstream dispatcher; the committing core reads its
/// identity and metadata, bumps the concurrency-retry counter, and
/// delivers the terminal result through its sink.
pub struct ProcessingCommand {
    /// The command's identity.
    pub message: CommandMessage,
    /// Opaque metadata propagated into published stream messages.
    pub items: HashMap<String, String>,
    /// Per-attempt execution state.
    pub execute_context: Arc<dyn CommandExecuteContext>,
    concurrent_retried_count: AtomicU32,
    sink: Arc<dyn CommandSink>,
}

impl ProcessingCommand {
    /// Wrap a command for processing.
    pub fn new(
        message: CommandMessage,
        items: HashMap<String, String>,
        execute_context: Arc<dyn CommandExecuteContext>,
        sink: Arc<dyn CommandSink>,
    ) -> Self {
        Self {
            message,
            items,
            execute_context,
            concurrent_retried_count: AtomicU32::new(0),
            sink,
        }
    }

    /// How many times this command has been retried after optimistic
    /// concurrency conflicts.
    pub fn concurrent_retried_count(&self) -> u32 {
        self.concurrent_retried_count.load(Ordering::Acquire)
    }

    /// Bump the concurrency-retry counter, returning the new value.
    pub fn increment_concurrent_retried_count(&self) -> u32 {
        self.concurrent_retried_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Deliver the terminal result for this attempt.
    pub fn complete(&self, result: CommandResult) {
        self.sink.complete(result);
    }
}

// Manual `Debug` because the execute context and sink are trait objects.
impl std::fmt::Debug for ProcessingCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingCommand")
            .field("message", &self.message)
            .field("items", &self.items)
            .field("concurrent_retried_count", &self.concurrent_retried_count)
            .finish()
    }
}
