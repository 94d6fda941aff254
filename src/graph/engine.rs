// ABOUTME: Async execution loop for the task graph container
// ABOUTME: Launches ready tasks concurrently, applies outcomes, and enforces retry budgets

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use super::container::{lock_task, Element, ElementId, FailedTask, Resolution, TaskGraph};
use super::error::GraphError;
use crate::tasks::{
    RegistrationCache, Task, TaskError, TaskOutcome, TaskPayload, TaskState, WorkerGateway,
};

const DEFAULT_MAX_CONCURRENT: usize = 10;

/// Everything task execution needs from the outside world: the dispatch
/// transport, the shared registration cache, and the concurrency cap.
#[derive(Clone)]
pub struct ExecutionEnv {
    pub gateway: Arc<dyn WorkerGateway>,
    pub cache: RegistrationCache,
    pub max_concurrent: usize,
}

impl ExecutionEnv {
    pub fn new(gateway: Arc<dyn WorkerGateway>) -> Self {
        Self {
            gateway,
            cache: RegistrationCache::new(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }

    pub fn with_cache(mut self, cache: RegistrationCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }
}

impl TaskGraph {
    /// Execute the graph to completion.
    ///
    /// Independent branches run concurrently under the environment's
    /// concurrency cap; a task becomes eligible only once every dependency of
    /// it and of each of its containing subgraphs has resolved, and its
    /// `execute_after` gate has elapsed. Returns the recorded failure when a
    /// task fails terminally with no recovery left.
    pub async fn execute(&mut self, env: &ExecutionEnv) -> Result<(), GraphError> {
        let semaphore = Arc::new(Semaphore::new(env.max_concurrent));
        let mut in_flight: FuturesUnordered<
            BoxFuture<'static, (ElementId, Result<Value, TaskError>)>,
        > = FuturesUnordered::new();
        let mut running: HashSet<ElementId> = HashSet::new();

        loop {
            if self.halted.is_none() {
                let now = Instant::now();
                for eid in self.ready_tasks(now, &running) {
                    let slot = match self.task_slot(eid) {
                        Some(slot) => slot,
                        None => continue,
                    };
                    let gateway = Arc::clone(&env.gateway);
                    let cache = env.cache.clone();
                    let semaphore = Arc::clone(&semaphore);
                    running.insert(eid);
                    in_flight.push(Box::pin(async move {
                        let _permit = semaphore.acquire_owned().await.ok();
                        let result = run_task(&slot, &gateway, &cache).await;
                        (eid, result)
                    }));
                }
            }

            if in_flight.is_empty() {
                if self.halted.is_some() || self.all_tasks_resolved() {
                    break;
                }
                match self.next_wake() {
                    Some(wake) => {
                        sleep_until(wake).await;
                        continue;
                    }
                    None => {
                        return Err(GraphError::Stalled {
                            pending: self.pending_count(),
                        })
                    }
                }
            }

            let wake = self.next_wake();
            let wake_at = wake.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                Some((eid, result)) = in_flight.next() => {
                    running.remove(&eid);
                    self.process_completion(eid, result)?;
                }
                _ = sleep_until(wake_at), if wake.is_some() => {}
            }
        }

        match self.halted.take() {
            Some(failed) => Err(GraphError::ExecutionFailed {
                task_name: failed.name.clone(),
                task_id: failed.task_id.clone(),
                error: failed
                    .error
                    .unwrap_or_else(|| TaskError::unclassified("task failed")),
            }),
            None => Ok(()),
        }
    }

    fn ready_tasks(&self, now: Instant, running: &HashSet<ElementId>) -> Vec<ElementId> {
        let mut ready = Vec::new();
        for (&eid, element) in &self.elements {
            let slot = match element {
                Element::Task(slot) => slot,
                Element::Subgraph(_) => continue,
            };
            if running.contains(&eid) || self.resolutions.contains_key(&eid) {
                continue;
            }
            {
                let task = lock_task(slot);
                if task.state() != TaskState::Pending || task.execute_after > now {
                    continue;
                }
            }
            if self.in_failed_scope(eid) {
                continue;
            }
            if self.dependencies_satisfied(eid) {
                ready.push(eid);
            }
        }
        ready
    }

    /// A task and every containing subgraph must have all dependencies
    /// resolved before the task may run.
    fn dependencies_satisfied(&self, element: ElementId) -> bool {
        let mut scope = Some(element);
        while let Some(current) = scope {
            for dependency in self.dependencies_of(current) {
                if !self.is_resolved(dependency) {
                    return false;
                }
            }
            scope = self.containing_subgraph(current);
        }
        true
    }

    fn in_failed_scope(&self, element: ElementId) -> bool {
        let mut scope = self.containing_subgraph(element);
        while let Some(current) = scope {
            if let Some(sub) = self.subgraph_ref(current) {
                if sub.state == TaskState::Failed {
                    return true;
                }
            }
            scope = self.containing_subgraph(current);
        }
        false
    }

    fn is_resolved(&self, element: ElementId) -> bool {
        if self.resolutions.contains_key(&element) {
            return true;
        }
        match self.elements.get(&element) {
            Some(Element::Task(_)) => false,
            Some(Element::Subgraph(sub)) => {
                sub.state != TaskState::Failed
                    && sub.members.iter().all(|&m| self.is_resolved(m))
            }
            // A removed element no longer gates anything.
            None => true,
        }
    }

    fn all_tasks_resolved(&self) -> bool {
        self.elements.iter().all(|(eid, element)| match element {
            Element::Task(_) => self.resolutions.contains_key(eid),
            Element::Subgraph(_) => true,
        })
    }

    fn pending_count(&self) -> usize {
        self.elements
            .iter()
            .filter(|(eid, element)| {
                matches!(element, Element::Task(_)) && !self.resolutions.contains_key(*eid)
            })
            .count()
    }

    /// Earliest `execute_after` among tasks that are otherwise runnable.
    fn next_wake(&self) -> Option<Instant> {
        let mut earliest: Option<Instant> = None;
        for (&eid, element) in &self.elements {
            let slot = match element {
                Element::Task(slot) => slot,
                Element::Subgraph(_) => continue,
            };
            if self.resolutions.contains_key(&eid) || self.in_failed_scope(eid) {
                continue;
            }
            let gate = {
                let task = lock_task(slot);
                if task.state() != TaskState::Pending {
                    continue;
                }
                task.execute_after
            };
            if !self.dependencies_satisfied(eid) {
                continue;
            }
            earliest = Some(match earliest {
                Some(current) if current <= gate => current,
                _ => gate,
            });
        }
        earliest
    }

    fn process_completion(
        &mut self,
        eid: ElementId,
        _result: Result<Value, TaskError>,
    ) -> Result<(), GraphError> {
        if self.halted.is_some() {
            return Ok(());
        }
        // The task may have been removed while in flight (abandoned scope);
        // its late result is discarded.
        let slot = match self.task_slot(eid) {
            Some(slot) => slot,
            None => return Ok(()),
        };

        let (outcome, failed) = {
            let task = lock_task(&slot);
            let failed = FailedTask {
                task_id: task.id.clone(),
                name: task.name.clone(),
                error: task.result.as_ref().and_then(|r| r.as_ref().err().cloned()),
            };
            (task.handle_task_terminated(), failed)
        };

        match outcome {
            TaskOutcome::Continue => {
                debug!(task = %failed.name, "task resolved");
                self.resolutions.insert(eid, Resolution::Succeeded);
            }
            TaskOutcome::Ignore => {
                info!(task = %failed.name, "task failure ignored");
                self.resolutions.insert(eid, Resolution::Ignored);
            }
            TaskOutcome::Retry {
                ignore_total_retries,
                retry_after,
            } => {
                let task = lock_task(&slot);
                let allowed =
                    ignore_total_retries || task.total_retries.allows(task.current_retries);
                if allowed {
                    let mut duplicate = task.duplicate();
                    // Unconditional retries are polling waits and consume no
                    // retry budget.
                    if !ignore_total_retries {
                        duplicate.current_retries += 1;
                    }
                    let delay = retry_after.unwrap_or(task.retry_interval);
                    duplicate.execute_after = Instant::now() + delay;
                    drop(task);
                    debug!(
                        task = %failed.name,
                        delay_secs = delay.as_secs(),
                        "rescheduling task"
                    );
                    *lock_task(&slot) = duplicate;
                } else {
                    drop(task);
                    warn!(task = %failed.name, "retry budget exhausted");
                    self.fail_element(eid, failed);
                }
            }
            TaskOutcome::Fail => self.fail_element(eid, failed),
        }
        Ok(())
    }

    /// Resolve a terminal task failure at the subgraph boundary, or halt the
    /// whole graph when there is no containing scope to recover in.
    fn fail_element(&mut self, eid: ElementId, failed: FailedTask) {
        error!(task = %failed.name, error = ?failed.error, "task failed terminally");
        match self.containing_subgraph(eid) {
            None => self.halted = Some(failed),
            Some(subgraph) => {
                self.record_subgraph_failure(subgraph, failed);
                self.handle_subgraph_failure(subgraph);
            }
        }
    }

    fn handle_subgraph_failure(&mut self, subgraph: ElementId) {
        let (handler, retries, failed, parent) = match self.subgraph_ref(subgraph) {
            Some(sub) => (
                sub.on_failure.clone(),
                sub.current_retries,
                sub.failed_task.clone(),
                sub.containing_subgraph,
            ),
            None => return,
        };
        let failed = failed.unwrap_or(FailedTask {
            task_id: String::new(),
            name: self
                .subgraph_ref(subgraph)
                .map(|s| s.name.clone())
                .unwrap_or_default(),
            error: None,
        });

        let handler = match handler {
            Some(handler) => handler,
            None => {
                // No recovery hook: bubble the failure upward, or halt.
                match parent {
                    None => self.halted = Some(failed),
                    Some(parent) => {
                        self.record_subgraph_failure(parent, failed);
                        self.handle_subgraph_failure(parent);
                    }
                }
                return;
            }
        };

        let resolution = handler.on_failure(self, subgraph);
        match resolution.outcome {
            TaskOutcome::Retry {
                ignore_total_retries,
                ..
            } => {
                let replacement = match resolution.replacement {
                    Some(replacement) => replacement,
                    None => {
                        self.halted = Some(failed);
                        return;
                    }
                };
                if ignore_total_retries || self.subgraph_retries.allows(retries) {
                    info!(subgraph = ?subgraph, "retrying failed subgraph with a fresh duplicate");
                    self.replace_element(subgraph, replacement);
                } else {
                    warn!("subgraph retry budget exhausted");
                    self.remove_task(replacement);
                    self.halted = Some(failed);
                }
            }
            TaskOutcome::Ignore => {
                self.resolutions.insert(subgraph, Resolution::Ignored);
                // The hook may have propagated the failure into the
                // containing subgraph; give that scope its turn.
                if let Some(parent) = parent {
                    let parent_failed = self
                        .subgraph_ref(parent)
                        .map(|s| s.state == TaskState::Failed)
                        .unwrap_or(false);
                    if parent_failed {
                        self.handle_subgraph_failure(parent);
                    }
                }
            }
            TaskOutcome::Fail | TaskOutcome::Continue => {
                self.halted = Some(failed);
            }
        }
    }
}

/// Drive one task to a terminal state.
///
/// Local payloads run their callable in place, blocking this worker. Remote
/// payloads verify registration, dispatch through the gateway, and await the
/// returned result handle.
async fn run_task(
    slot: &Arc<Mutex<Task>>,
    gateway: &Arc<dyn WorkerGateway>,
    cache: &RegistrationCache,
) -> Result<Value, TaskError> {
    let result = run_task_inner(slot, gateway, cache).await;
    let mut task = lock_task(slot);
    if !task.state().is_terminal() {
        if let Err(transition_err) = task.record_result(result.clone()) {
            return Err(transition_err);
        }
    }
    result
}

async fn run_task_inner(
    slot: &Arc<Mutex<Task>>,
    gateway: &Arc<dyn WorkerGateway>,
    cache: &RegistrationCache,
) -> Result<Value, TaskError> {
    let (payload, task_id, name) = {
        let mut task = lock_task(slot);
        task.started_at = Some(Utc::now());
        (task.payload.clone(), task.id.clone(), task.name.clone())
    };

    match payload {
        TaskPayload::Nop => {
            lock_task(slot).set_state(TaskState::Sent)?;
            Ok(Value::Null)
        }
        TaskPayload::Local(callable) => {
            lock_task(slot).set_state(TaskState::Sent)?;
            debug!(task = %name, "executing local task");
            callable()
        }
        TaskPayload::Remote(invocation) => {
            lock_task(slot).set_state(TaskState::Sending)?;
            cache.verify_registered(gateway, &invocation).await?;
            debug!(
                task = %name,
                target = %invocation.target,
                "sending task to worker"
            );
            let handle = gateway.dispatch(&invocation, &task_id).await?;
            lock_task(slot).set_state(TaskState::Sent)?;
            lock_task(slot).set_state(TaskState::Started)?;
            handle.await
        }
    }
}
