// ABOUTME: Task outcome protocol returned by success/failure handlers
// ABOUTME: Drives retry, abort, ignore, and continue decisions after task completion

use std::time::Duration;

/// The decision taken after a task reaches a terminal state.
///
/// Returned by success/failure handlers and consumed by the graph engine:
/// `Retry` re-executes a fresh duplicate of the task, `Fail` terminates the
/// enclosing scope, `Ignore` resolves the task as if it had succeeded, and
/// `Continue` accepts the result and moves on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Retry {
        /// Bypass the task's retry budget entirely. Used for polling-style
        /// waits that must re-execute without consuming retries.
        ignore_total_retries: bool,
        /// Delay before the duplicate becomes eligible, overriding the
        /// task's `retry_interval`.
        retry_after: Option<Duration>,
    },
    Fail,
    Ignore,
    Continue,
}

impl TaskOutcome {
    pub fn retry() -> Self {
        TaskOutcome::Retry {
            ignore_total_retries: false,
            retry_after: None,
        }
    }

    pub fn retry_ignoring_budget() -> Self {
        TaskOutcome::Retry {
            ignore_total_retries: true,
            retry_after: None,
        }
    }

    pub fn retry_after(delay: Duration) -> Self {
        TaskOutcome::Retry {
            ignore_total_retries: false,
            retry_after: Some(delay),
        }
    }

    pub fn fail() -> Self {
        TaskOutcome::Fail
    }

    pub fn ignore() -> Self {
        TaskOutcome::Ignore
    }

    pub fn cont() -> Self {
        TaskOutcome::Continue
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, TaskOutcome::Retry { .. })
    }
}
