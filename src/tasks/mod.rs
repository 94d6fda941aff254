// ABOUTME: Task execution model for the deployment orchestration core
// ABOUTME: Defines task state machine, outcome protocol, and remote dispatch seam

pub mod error;
pub mod outcome;
pub mod remote;
pub mod task;

pub use error::TaskError;
pub use outcome::TaskOutcome;
pub use remote::{RegistrationCache, RemoteResultFuture, WorkerGateway};
pub use task::{
    LocalCallable, OnFailure, OnSuccess, RemoteInvocation, RetryBudget, Task, TaskHandler, TaskId,
    TaskPayload, TaskState, DEFAULT_RETRY_INTERVAL,
};
