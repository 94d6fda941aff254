// ABOUTME: Common utilities and helpers for integration tests
// ABOUTME: Provides a scripted worker gateway, recording runtime, and topology helpers

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};

use convoy::lifecycle::interfaces::COMPUTE_TYPE;
use convoy::tasks::{
    RegistrationCache, RemoteInvocation, RemoteResultFuture, TaskError, WorkerGateway,
};
use convoy::{
    ExecutionConfig, ExecutionEnv, Node, NodeInstance, RuntimeChannel, TaskGraph, WorkflowContext,
};

/// Honors `RUST_LOG` when debugging test runs; safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Worker gateway returning scripted results per operation name, recording
/// every dispatch as a `(target, operation)` pair.
pub struct MockGateway {
    registered: Mutex<HashMap<String, HashSet<String>>>,
    scripts: Mutex<HashMap<String, VecDeque<Result<Value, TaskError>>>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl MockGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registered: Mutex::new(HashMap::new()),
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn register(&self, target: &str, operations: &[&str]) {
        let mut registered = self.registered.lock().unwrap();
        let entry = registered.entry(target.to_string()).or_default();
        for operation in operations {
            entry.insert(operation.to_string());
        }
    }

    /// Queue results for an operation; dispatches beyond the script succeed
    /// with a null result.
    pub fn script(&self, operation: &str, results: Vec<Result<Value, TaskError>>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(operation.to_string(), results.into());
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn operations_called(&self) -> Vec<String> {
        self.calls().into_iter().map(|(_, op)| op).collect()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.calls().iter().filter(|(_, op)| op == operation).count()
    }

    /// Index of the first dispatch matching target and operation.
    pub fn call_position(&self, target: &str, operation: &str) -> Option<usize> {
        self.calls()
            .iter()
            .position(|(t, op)| t == target && op == operation)
    }
}

#[async_trait]
impl WorkerGateway for MockGateway {
    async fn registered_operations(&self, target: &str) -> Result<HashSet<String>, TaskError> {
        Ok(self
            .registered
            .lock()
            .unwrap()
            .get(target)
            .cloned()
            .unwrap_or_default())
    }

    async fn dispatch(
        &self,
        invocation: &RemoteInvocation,
        _task_id: &str,
    ) -> Result<RemoteResultFuture, TaskError> {
        self.calls
            .lock()
            .unwrap()
            .push((invocation.target.clone(), invocation.operation.clone()));
        let result = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&invocation.operation)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(Ok(Value::Null));
        Ok(Box::pin(async move { result }))
    }
}

/// Runtime channel recording state transitions and events per instance.
#[derive(Default)]
pub struct RecordingRuntime {
    pub states: Mutex<Vec<(String, String)>>,
    pub events: Mutex<Vec<(String, String)>>,
}

impl RecordingRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn states_for(&self, instance_id: &str) -> Vec<String> {
        self.states
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == instance_id)
            .map(|(_, state)| state.clone())
            .collect()
    }

    pub fn events_for(&self, instance_id: &str) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == instance_id)
            .map(|(_, message)| message.clone())
            .collect()
    }
}

impl RuntimeChannel for RecordingRuntime {
    fn set_instance_state(&self, instance_id: &str, state: &str) -> Result<(), TaskError> {
        self.states
            .lock()
            .unwrap()
            .push((instance_id.to_string(), state.to_string()));
        Ok(())
    }

    fn send_event(&self, instance_id: &str, message: &str) {
        self.events
            .lock()
            .unwrap()
            .push((instance_id.to_string(), message.to_string()));
    }
}

/// Shared fixture: one gateway, one runtime, one registration cache, one
/// workflow context.
pub struct TestTopology {
    pub gateway: Arc<MockGateway>,
    pub runtime: Arc<RecordingRuntime>,
    cache: RegistrationCache,
    config: ExecutionConfig,
    ctx: Arc<WorkflowContext>,
}

impl TestTopology {
    pub fn new() -> Self {
        // Zero retry interval keeps retry-heavy tests fast.
        Self::with_config(ExecutionConfig {
            retry_interval_secs: 0,
            ..ExecutionConfig::default()
        })
    }

    pub fn with_config(config: ExecutionConfig) -> Self {
        init_tracing();
        let gateway = MockGateway::new();
        let runtime = RecordingRuntime::new();
        let ctx = WorkflowContext::new(runtime.clone(), &config);
        Self {
            gateway,
            runtime,
            cache: RegistrationCache::new(),
            config,
            ctx,
        }
    }

    /// A graph carrying the fixture's subgraph retry budget.
    pub fn graph(&self) -> TaskGraph {
        TaskGraph::new().with_subgraph_retries(self.config.subgraph_retry_budget())
    }

    /// A plain instance whose declared operations are registered on its
    /// worker target.
    pub fn instance(&self, id: &str, operations: &[&str]) -> NodeInstance {
        self.gateway.register(id, operations);
        self.instance_with(id, operations, Vec::new(), Value::Null)
    }

    /// An instance whose node declares operations the worker never
    /// registered.
    pub fn unregistered_instance(&self, id: &str, operations: &[&str]) -> NodeInstance {
        self.instance_with(id, operations, Vec::new(), Value::Null)
    }

    /// A compute instance with the given node properties.
    pub fn host_instance(&self, id: &str, operations: &[&str], properties: Value) -> NodeInstance {
        self.gateway.register(id, operations);
        self.instance_with(id, operations, vec![COMPUTE_TYPE.to_string()], properties)
    }

    fn instance_with(
        &self,
        id: &str,
        operations: &[&str],
        type_hierarchy: Vec<String>,
        properties: Value,
    ) -> NodeInstance {
        let properties: Map<String, Value> = properties.as_object().cloned().unwrap_or_default();
        let node = Arc::new(Node {
            name: id.to_string(),
            type_hierarchy,
            properties,
            operations: operations.iter().map(|s| s.to_string()).collect(),
            plugins_to_install: Vec::new(),
        });
        NodeInstance::new(id, node, self.ctx.clone())
    }

    /// All executions built from one fixture share the registration cache,
    /// as concurrent branches do in production.
    pub fn env(&self) -> ExecutionEnv {
        ExecutionEnv::new(self.gateway.clone())
            .with_cache(self.cache.clone())
            .with_max_concurrent(self.config.max_concurrent)
    }
}
