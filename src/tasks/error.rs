// ABOUTME: Error classification for task execution results
// ABOUTME: Distinguishes transient conditions from defects that must never be retried

use std::time::Duration;
use thiserror::Error;

/// Classified error produced by task execution.
///
/// Classification only ever downgrades a handler's retry decision: a
/// `NonRecoverable` error forces a terminal failure regardless of handler
/// intent, while a `Recoverable` error may carry a delay that overrides the
/// task's configured retry interval. `Unclassified` errors leave the
/// handler's decision untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("recoverable error: {message}")]
    Recoverable {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("non-recoverable error: {message}")]
    NonRecoverable { message: String },

    #[error("{message}")]
    Unclassified { message: String },
}

impl TaskError {
    pub fn recoverable(message: impl Into<String>) -> Self {
        TaskError::Recoverable {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn recoverable_after(message: impl Into<String>, retry_after: Duration) -> Self {
        TaskError::Recoverable {
            message: message.into(),
            retry_after: Some(retry_after),
        }
    }

    pub fn non_recoverable(message: impl Into<String>) -> Self {
        TaskError::NonRecoverable {
            message: message.into(),
        }
    }

    pub fn unclassified(message: impl Into<String>) -> Self {
        TaskError::Unclassified {
            message: message.into(),
        }
    }

    pub fn is_non_recoverable(&self) -> bool {
        matches!(self, TaskError::NonRecoverable { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TaskError::Recoverable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_accessors() {
        let err = TaskError::recoverable_after("worker busy", Duration::from_secs(5));
        assert!(!err.is_non_recoverable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(5)));

        let err = TaskError::non_recoverable("missing operation");
        assert!(err.is_non_recoverable());
        assert_eq!(err.retry_after(), None);
    }
}
