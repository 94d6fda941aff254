// ABOUTME: Error types for task graph construction and execution
// ABOUTME: Defines terminal failure and stall conditions surfaced by the engine

use thiserror::Error;

use crate::tasks::TaskError;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("task {task_name} ({task_id}) failed: {error}")]
    ExecutionFailed {
        task_name: String,
        task_id: String,
        #[source]
        error: TaskError,
    },

    #[error("execution stalled: {pending} tasks can never become ready")]
    Stalled { pending: usize },
}

pub type Result<T> = std::result::Result<T, GraphError>;
