// ABOUTME: Managed entity model consumed by the lifecycle graph builder
// ABOUTME: Node instances, typed relationships, and the runtime side-effect seam

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::config::ExecutionConfig;
use crate::tasks::{RemoteInvocation, RetryBudget, Task, TaskError};

/// Side-effect seam for instance state transitions and event emission.
/// Passed explicitly wherever it is needed; the core keeps no ambient
/// context.
pub trait RuntimeChannel: Send + Sync {
    fn set_instance_state(&self, instance_id: &str, state: &str) -> Result<(), TaskError>;
    fn send_event(&self, instance_id: &str, message: &str);
}

/// Shared per-invocation context stamped onto every built task: the runtime
/// seam plus retry defaults from configuration.
pub struct WorkflowContext {
    pub runtime: Arc<dyn RuntimeChannel>,
    pub total_retries: RetryBudget,
    pub retry_interval: Duration,
}

impl WorkflowContext {
    pub fn new(runtime: Arc<dyn RuntimeChannel>, config: &ExecutionConfig) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            total_retries: config.retry_budget(),
            retry_interval: config.retry_interval(),
        })
    }
}

/// A plugin declared on a node, installed on its host during bring-up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Plugin {
    pub name: String,
    #[serde(default)]
    pub install: bool,
}

/// Static node declaration shared by all of its instances.
#[derive(Debug, Clone, Default)]
pub struct Node {
    pub name: String,
    pub type_hierarchy: Vec<String>,
    pub properties: Map<String, Value>,
    /// Operation names declared on this node. Executing an undeclared
    /// operation yields a nop task.
    pub operations: HashSet<String>,
    pub plugins_to_install: Vec<Plugin>,
}

impl Node {
    pub fn property_bool(&self, key: &str) -> Option<bool> {
        self.properties.get(key).and_then(Value::as_bool)
    }
}

/// One managed entity in the topology being brought to a lifecycle state.
#[derive(Clone)]
pub struct NodeInstance {
    pub id: String,
    /// Worker target (queue name) that executes this instance's operations.
    pub target: String,
    pub node: Arc<Node>,
    pub relationships: Vec<Relationship>,
    ctx: Arc<WorkflowContext>,
}

impl NodeInstance {
    pub fn new(id: impl Into<String>, node: Arc<Node>, ctx: Arc<WorkflowContext>) -> Self {
        let id = id.into();
        Self {
            target: id.clone(),
            id,
            node,
            relationships: Vec::new(),
            ctx,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    /// Declare a directed relationship from this instance to `target`,
    /// carrying the given relationship-lifecycle operations.
    pub fn add_relationship(&mut self, target: &NodeInstance, operations: HashSet<String>) {
        self.relationships.push(Relationship {
            source_id: self.id.clone(),
            source_target: self.target.clone(),
            target_id: target.id.clone(),
            target_target: target.target.clone(),
            operations,
            ctx: Arc::clone(&self.ctx),
        });
    }

    fn stamp(&self, task: Task) -> Task {
        task.with_info(self.id.clone())
            .with_retries(self.ctx.total_retries, self.ctx.retry_interval)
    }

    /// Task transitioning this instance's declared lifecycle state.
    pub fn set_state(&self, state: &str) -> Task {
        let runtime = Arc::clone(&self.ctx.runtime);
        let instance_id = self.id.clone();
        let state = state.to_string();
        let name = format!("set_state.{}", state);
        let task_state = state.clone();
        self.stamp(Task::local(name, move || {
            runtime.set_instance_state(&instance_id, &task_state)?;
            Ok(Value::String(task_state.clone()))
        }))
    }

    /// Task emitting an event on this instance's event stream.
    pub fn send_event(&self, message: &str) -> Task {
        let runtime = Arc::clone(&self.ctx.runtime);
        let instance_id = self.id.clone();
        let message = message.to_string();
        let info = message.clone();
        self.stamp(
            Task::local("send_event", move || {
                runtime.send_event(&instance_id, &message);
                Ok(Value::Null)
            })
            .with_info(info),
        )
    }

    /// Emit an event immediately, outside any task. Used by failure handlers.
    pub fn notify(&self, message: &str) {
        self.ctx.runtime.send_event(&self.id, message);
    }

    /// Task executing a named operation on this instance's worker. Undeclared
    /// operations resolve to a nop.
    pub fn execute_operation(&self, operation: &str) -> Task {
        self.execute_operation_with(operation, Value::Null, true)
    }

    pub fn execute_operation_with(
        &self,
        operation: &str,
        kwargs: Value,
        send_task_events: bool,
    ) -> Task {
        if !self.node.operations.contains(operation) {
            return Task::nop();
        }
        self.stamp(Task::remote(RemoteInvocation {
            operation: operation.to_string(),
            target: self.target.clone(),
            payload: json!({
                "node_instance_id": self.id,
                "kwargs": kwargs,
            }),
            send_task_events,
        }))
    }
}

/// Directed, typed association between two node instances, carrying its own
/// lifecycle operations (preconfigure/postconfigure/establish/unlink).
#[derive(Clone)]
pub struct Relationship {
    pub target_id: String,
    /// Operations declared on this relationship's interfaces.
    pub operations: HashSet<String>,
    source_id: String,
    source_target: String,
    target_target: String,
    ctx: Arc<WorkflowContext>,
}

impl Relationship {
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    fn operation_task(&self, operation: &str, worker_target: &str) -> Task {
        if !self.operations.contains(operation) {
            return Task::nop();
        }
        Task::remote(RemoteInvocation {
            operation: operation.to_string(),
            target: worker_target.to_string(),
            payload: json!({
                "source_id": self.source_id,
                "target_id": self.target_id,
            }),
            send_task_events: true,
        })
        .with_info(format!("{} -> {}", self.source_id, self.target_id))
        .with_retries(self.ctx.total_retries, self.ctx.retry_interval)
    }

    /// Run a relationship operation on the source instance's worker.
    pub fn execute_source_operation(&self, operation: &str) -> Task {
        self.operation_task(operation, &self.source_target)
    }

    /// Run a relationship operation on the target instance's worker.
    pub fn execute_target_operation(&self, operation: &str) -> Task {
        self.operation_task(operation, &self.target_target)
    }
}
