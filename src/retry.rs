//! Bounded retry of fallible async I/O operations.
//!
//! Every store append, store lookup, and downstream publish in the
//! committing pipeline goes through [`execute`]: transient failures are
//! retried with capped exponential backoff, terminal failures (and
//! exhausted budgets) resolve to an error message the caller surfaces in a
//! failed command result. Success and terminal failure are mutually
//! exclusive by construction -- the executor returns a `Result`.

use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Classifies an operation error as transient (retryable) or terminal.
pub trait Retryable: fmt::Display {
    /// `true` when retrying the operation could plausibly succeed.
    fn is_transient(&self) -> bool;
}

/// Retry budget and backoff shape for one logical I/O operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Values below 1 behave as 1.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each subsequent retry.
    pub base_delay: Duration,
    /// Upper bound on the backoff delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (1-based): `base * 2^(retry-1)`,
    /// capped at `max_delay`.
    fn delay_for(&self, retry: u32) -> Duration {
        let mut delay = self.base_delay;
        for _ in 1..retry {
            delay = (delay * 2).min(self.max_delay);
        }
        delay.min(self.max_delay)
    }
}

/// Drive `op` to a terminal outcome under `policy`.
///
/// Awaits attempts in a loop. A transient failure with budget remaining
/// sleeps the backoff and retries; a terminal failure (non-transient error
/// or budget exhausted) resolves to `Err` with a message naming `op_name`.
/// Each retry logs one warning carrying `op_name`, the attempt number, and
/// `describe()`.
///
/// # Arguments
///
/// * `op_name` - Short operation name for diagnostics (e.g. `"append"`).
/// * `policy` - Retry budget and backoff shape.
/// * `describe` - Lazily evaluated context for log lines (e.g. aggregate
///   and command ids). Only called on failures.
/// * `op` - The operation; called once per attempt.
pub(crate) async fn execute<T, E, F, Fut, D>(
    op_name: &str,
    policy: &RetryPolicy,
    describe: D,
    op: F,
) -> Result<T, String>
where
    E: Retryable,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    D: Fn() -> String,
{
    let mut attempt: u32 = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    op = op_name,
                    attempt,
                    context = %describe(),
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) if error.is_transient() => {
                tracing::error!(
                    op = op_name,
                    attempts = attempt,
                    context = %describe(),
                    error = %error,
                    "retry budget exhausted"
                );
                return Err(format!("{op_name} failed after {attempt} attempts: {error}"));
            }
            Err(error) => {
                tracing::error!(
                    op = op_name,
                    context = %describe(),
                    error = %error,
                    "terminal failure"
                );
                return Err(format!("{op_name} failed: {error}"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::StoreError;

    fn no_context() -> String {
        String::new()
    }

    #[tokio::test]
    async fn success_on_first_attempt_runs_op_once() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> =
            execute("probe", &RetryPolicy::default(), no_context, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, StoreError>(7) }
            })
            .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = execute("probe", &RetryPolicy::default(), no_context, || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call < 2 {
                    Err(StoreError::Io("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_resolves_to_error_naming_the_op() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> =
            execute("append", &RetryPolicy::default(), no_context, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StoreError::Io("still down".into())) }
            })
            .await;

        let message = result.expect_err("persistent failure must resolve to Err");
        assert!(message.contains("append"), "message should name the op: {message}");
        assert!(message.contains("still down"), "message should carry the error: {message}");
        assert_eq!(calls.load(Ordering::SeqCst), 3, "default policy allows 3 attempts");
    }

    #[tokio::test]
    async fn terminal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> =
            execute("append", &RetryPolicy::default(), no_context, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StoreError::Corrupt("bad bytes".into())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        };

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(300)); // capped
        assert_eq!(policy.delay_for(4), Duration::from_millis(300)); // still capped
    }
}
