// ABOUTME: Core task type with state machine, retry state, and handler dispatch
// ABOUTME: Tasks are the atomic units of work scheduled by the task graph

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::time::Instant;

use super::error::TaskError;
use super::outcome::TaskOutcome;

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(30);

pub type TaskId = String;

/// Task execution states. Transitions are monotonic: a task moves forward
/// through {Pending, Sending, Sent, Started} and ends in Succeeded or Failed.
/// Only a fresh duplicate re-enters Pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Sending,
    Sent,
    Started,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            TaskState::Pending => 0,
            TaskState::Sending => 1,
            TaskState::Sent => 2,
            TaskState::Started => 3,
            TaskState::Succeeded => 4,
            TaskState::Failed => 4,
        }
    }

    fn can_advance_to(&self, next: TaskState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Sending => write!(f, "sending"),
            TaskState::Sent => write!(f, "sent"),
            TaskState::Started => write!(f, "started"),
            TaskState::Succeeded => write!(f, "succeeded"),
            TaskState::Failed => write!(f, "failed"),
        }
    }
}

/// Maximum number of retries honored for a task. `Unlimited` corresponds to
/// the conventional `-1` in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryBudget {
    Unlimited,
    Limited(u32),
}

impl RetryBudget {
    pub fn from_config(total_retries: i64) -> Self {
        if total_retries < 0 {
            RetryBudget::Unlimited
        } else {
            RetryBudget::Limited(total_retries as u32)
        }
    }

    pub fn allows(&self, current_retries: u32) -> bool {
        match self {
            RetryBudget::Unlimited => true,
            RetryBudget::Limited(total) => current_retries < *total,
        }
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        RetryBudget::Unlimited
    }
}

pub type LocalCallable = Arc<dyn Fn() -> Result<Value, TaskError> + Send + Sync>;

/// Payload of a remote task: a named operation dispatched to a worker target.
#[derive(Debug, Clone)]
pub struct RemoteInvocation {
    pub operation: String,
    pub target: String,
    pub payload: Value,
    pub send_task_events: bool,
}

/// Execution strategy of a task. Local payloads run their callable in the
/// calling execution context; remote payloads are dispatched to a worker and
/// observed through a result handle; nop payloads resolve immediately and
/// stand in for undeclared operations and empty fork-join groups.
#[derive(Clone)]
pub enum TaskPayload {
    Local(LocalCallable),
    Remote(RemoteInvocation),
    Nop,
}

impl fmt::Debug for TaskPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskPayload::Local(_) => write!(f, "Local"),
            TaskPayload::Remote(inv) => write!(f, "Remote({} -> {})", inv.operation, inv.target),
            TaskPayload::Nop => write!(f, "Nop"),
        }
    }
}

/// Per-task strategy consulted after the task reaches a terminal state.
///
/// Defaults implement the base protocol: success continues, failure retries.
/// Implementors override the one side they care about.
pub trait TaskHandler: Send + Sync {
    fn on_success(&self, _task: &Task) -> TaskOutcome {
        TaskOutcome::cont()
    }

    fn on_failure(&self, _task: &Task) -> TaskOutcome {
        TaskOutcome::retry()
    }
}

/// Adapter wrapping a closure as a success-only handler.
pub struct OnSuccess<F>(pub F);

impl<F> TaskHandler for OnSuccess<F>
where
    F: Fn(&Task) -> TaskOutcome + Send + Sync,
{
    fn on_success(&self, task: &Task) -> TaskOutcome {
        (self.0)(task)
    }
}

/// Adapter wrapping a closure as a failure-only handler.
pub struct OnFailure<F>(pub F);

impl<F> TaskHandler for OnFailure<F>
where
    F: Fn(&Task) -> TaskOutcome + Send + Sync,
{
    fn on_failure(&self, task: &Task) -> TaskOutcome {
        (self.0)(task)
    }
}

/// A schedulable unit of work.
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub info: Option<String>,
    state: TaskState,
    pub total_retries: RetryBudget,
    pub retry_interval: Duration,
    pub current_retries: u32,
    /// The scheduler must not run this task before this instant. Overridden
    /// by the graph engine when scheduling retries.
    pub execute_after: Instant,
    pub handler: Option<Arc<dyn TaskHandler>>,
    pub payload: TaskPayload,
    pub result: Option<Result<Value, TaskError>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, String>,
}

impl Task {
    fn new(name: impl Into<String>, payload: TaskPayload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            info: None,
            state: TaskState::Pending,
            total_retries: RetryBudget::default(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            current_retries: 0,
            execute_after: Instant::now(),
            handler: None,
            payload,
            result: None,
            started_at: None,
            finished_at: None,
            metadata: HashMap::new(),
        }
    }

    pub fn local<F>(name: impl Into<String>, callable: F) -> Self
    where
        F: Fn() -> Result<Value, TaskError> + Send + Sync + 'static,
    {
        Self::new(name, TaskPayload::Local(Arc::new(callable)))
    }

    pub fn remote(invocation: RemoteInvocation) -> Self {
        let name = invocation.operation.clone();
        Self::new(name, TaskPayload::Remote(invocation))
    }

    pub fn nop() -> Self {
        Self::new("NOP", TaskPayload::Nop)
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = Some(info.into());
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_retries(mut self, total_retries: RetryBudget, retry_interval: Duration) -> Self {
        self.total_retries = total_retries;
        self.retry_interval = retry_interval;
        self
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Advance the task state. Regressions and transitions out of a terminal
    /// state are defects and classified non-recoverable.
    pub fn set_state(&mut self, next: TaskState) -> Result<(), TaskError> {
        if !self.state.can_advance_to(next) {
            return Err(TaskError::non_recoverable(format!(
                "illegal state transition {} -> {} on task {}",
                self.state, next, self
            )));
        }
        self.state = next;
        Ok(())
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.payload, TaskPayload::Remote(_))
    }

    pub fn is_nop(&self) -> bool {
        matches!(self.payload, TaskPayload::Nop)
    }

    /// Record the terminal execution result and stamp completion time.
    pub fn record_result(&mut self, result: Result<Value, TaskError>) -> Result<(), TaskError> {
        let next = if result.is_ok() {
            TaskState::Succeeded
        } else {
            TaskState::Failed
        };
        self.set_state(next)?;
        self.result = Some(result);
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Dispatch to the success or failure handler once a terminal state is
    /// reached, returning the outcome the graph engine must honor.
    pub fn handle_task_terminated(&self) -> TaskOutcome {
        if self.state == TaskState::Failed {
            self.handle_task_failed()
        } else {
            self.handle_task_succeeded()
        }
    }

    fn handle_task_succeeded(&self) -> TaskOutcome {
        match &self.handler {
            Some(handler) => handler.on_success(self),
            None => TaskOutcome::cont(),
        }
    }

    fn handle_task_failed(&self) -> TaskOutcome {
        let mut outcome = match &self.handler {
            Some(handler) => handler.on_failure(self),
            None => TaskOutcome::retry(),
        };
        // Error classification may downgrade a remote retry to a terminal
        // failure, or stamp a recoverable error's delay onto the outcome. It
        // never upgrades a handler's fail decision.
        if outcome.is_retry() && self.is_remote() {
            match self.result.as_ref().and_then(|r| r.as_ref().err()) {
                Some(err) if err.is_non_recoverable() => outcome = TaskOutcome::fail(),
                Some(TaskError::Recoverable { retry_after, .. }) => {
                    if let TaskOutcome::Retry {
                        retry_after: ref mut slot,
                        ..
                    } = outcome
                    {
                        *slot = *retry_after;
                    }
                }
                _ => {}
            }
        }
        outcome
    }

    /// A fresh instance of this task with a new id, back in Pending. Retry
    /// counters are copied so the retry budget spans duplicates.
    pub fn duplicate(&self) -> Task {
        Task {
            id: uuid::Uuid::new_v4().to_string(),
            name: self.name.clone(),
            info: self.info.clone(),
            state: TaskState::Pending,
            total_retries: self.total_retries,
            retry_interval: self.retry_interval,
            current_retries: self.current_retries,
            execute_after: Instant::now(),
            handler: self.handler.clone(),
            payload: self.payload.clone(),
            result: None,
            started_at: None,
            finished_at: None,
            metadata: self.metadata.clone(),
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.info {
            Some(info) => write!(f, "{}({})", self.name, info),
            None => write!(f, "{}()", self.name),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("current_retries", &self.current_retries)
            .field("payload", &self.payload)
            .finish()
    }
}
