// ABOUTME: Execution configuration with retry and concurrency defaults
// ABOUTME: Deserialized by callers and converted into per-task retry settings

use std::time::Duration;

use serde::Deserialize;

use crate::tasks::RetryBudget;

/// Retry and concurrency defaults stamped onto built tasks. `-1` means
/// unlimited retries, matching the conventional encoding.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutionConfig {
    pub total_retries: i64,
    pub retry_interval_secs: u64,
    pub subgraph_retries: i64,
    pub max_concurrent: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            total_retries: -1,
            retry_interval_secs: 30,
            subgraph_retries: -1,
            max_concurrent: 10,
        }
    }
}

impl ExecutionConfig {
    pub fn retry_budget(&self) -> RetryBudget {
        RetryBudget::from_config(self.total_retries)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn subgraph_retry_budget(&self) -> RetryBudget {
        RetryBudget::from_config(self.subgraph_retries)
    }
}
