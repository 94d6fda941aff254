// ABOUTME: Host bring-up and teardown steps spliced into compute subgraphs
// ABOUTME: State polling, agent provisioning, plugin install, monitoring agent

use std::sync::Arc;

use serde_json::{json, Value};

use crate::lifecycle::interfaces::*;
use crate::node::{NodeInstance, Plugin};
use crate::tasks::{Task, TaskHandler, TaskOutcome};

pub(crate) fn is_host_instance(instance: &NodeInstance) -> bool {
    instance
        .node
        .type_hierarchy
        .iter()
        .any(|t| t == COMPUTE_TYPE)
}

/// Re-polls `host.get_state` until the host reports itself up. Polling does
/// not consume the task's retry budget.
struct HostUpHandler;

impl TaskHandler for HostUpHandler {
    fn on_success(&self, task: &Task) -> TaskOutcome {
        let up = task
            .result
            .as_ref()
            .and_then(|r| r.as_ref().ok())
            .map(value_truthy)
            .unwrap_or(false);
        if up {
            TaskOutcome::cont()
        } else {
            TaskOutcome::retry_ignoring_budget()
        }
    }
}

fn value_truthy(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => false,
        Value::Bool(true) => true,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn wait_for_host_to_start(instance: &NodeInstance) -> Task {
    let task = instance.execute_operation(HOST_GET_STATE);
    // Undeclared state checks resolve to a nop; polling a nop would spin.
    if task.is_nop() {
        return task;
    }
    task.with_handler(Arc::new(HostUpHandler))
}

/// Steps appended to a host's install subgraph after `lifecycle.start`:
/// wait for the host, provision its agent, then its monitoring agent.
pub(crate) fn host_post_start(instance: &NodeInstance) -> Vec<Task> {
    let mut tasks = vec![wait_for_host_to_start(instance)];
    if instance.node.property_bool(PROP_INSTALL_AGENT) == Some(true) {
        let ops = &instance.node.operations;
        if ops.contains(AGENT_CREATE) {
            tasks.push(instance.send_event("Creating agent"));
            tasks.push(instance.execute_operation(AGENT_CREATE));
            tasks.push(instance.send_event("Configuring agent"));
            tasks.push(instance.execute_operation(AGENT_CONFIGURE));
            tasks.push(instance.send_event("Starting agent"));
            tasks.push(instance.execute_operation(AGENT_START));
        } else {
            tasks.push(instance.send_event("Installing agent"));
            tasks.push(instance.execute_operation(WORKER_INSTALLER_INSTALL));
            tasks.push(instance.send_event("Starting agent"));
            tasks.push(instance.execute_operation(WORKER_INSTALLER_START));
        }
    }
    tasks.extend(prepare_running_agent(instance));
    tasks
}

fn prepare_running_agent(instance: &NodeInstance) -> Vec<Task> {
    let ops = &instance.node.operations;
    let plugins: Vec<Plugin> = instance
        .node
        .plugins_to_install
        .iter()
        .filter(|p| p.install)
        .cloned()
        .collect();

    let mut tasks = Vec::new();
    if !plugins.is_empty() {
        tasks.push(instance.send_event("Installing plugins"));
        let kwargs = json!({ "plugins": plugins });
        let install_op = if ops.contains(AGENT_INSTALL_PLUGINS) {
            AGENT_INSTALL_PLUGINS
        } else {
            PLUGIN_INSTALLER_INSTALL
        };
        tasks.push(instance.execute_operation_with(install_op, kwargs, true));

        // The agent has to pick up the new plugins, so restart it. Hosts the
        // orchestrator cannot reach directly are restarted over the broker.
        if instance.node.property_bool(PROP_REMOTE_EXECUTION) == Some(false) {
            tasks.push(instance.send_event("Restarting agent via message broker"));
            tasks.push(instance.execute_operation_with(AGENT_RESTART_AMQP, Value::Null, false));
        } else {
            tasks.push(instance.send_event("Restarting agent"));
            let restart_op = if ops.contains(AGENT_RESTART) {
                AGENT_RESTART
            } else {
                WORKER_INSTALLER_RESTART
            };
            tasks.push(instance.execute_operation_with(restart_op, Value::Null, false));
        }
    }
    tasks.push(instance.execute_operation(MONITORING_AGENT_INSTALL));
    tasks.push(instance.execute_operation(MONITORING_AGENT_START));
    tasks
}

/// Steps prepended to a host's uninstall subgraph before `lifecycle.stop`:
/// stop the monitoring agent, then stop and delete the agent itself.
pub(crate) fn host_pre_stop(instance: &NodeInstance) -> Vec<Task> {
    let ops = &instance.node.operations;
    let mut tasks = vec![
        instance.execute_operation(MONITORING_AGENT_STOP),
        instance.execute_operation(MONITORING_AGENT_UNINSTALL),
    ];
    if instance.node.property_bool(PROP_INSTALL_AGENT) == Some(true) {
        if instance.node.property_bool(PROP_REMOTE_EXECUTION) == Some(false) {
            tasks.push(instance.send_event("Stopping agent"));
            tasks.push(instance.execute_operation_with(AGENT_STOP_AMQP, Value::Null, false));
            tasks.push(instance.send_event("Deleting agent"));
            tasks.push(instance.execute_operation(AGENT_DELETE));
        } else if ops.contains(AGENT_STOP) {
            tasks.push(instance.send_event("Stopping agent"));
            tasks.push(instance.execute_operation(AGENT_STOP));
            tasks.push(instance.send_event("Deleting agent"));
            tasks.push(instance.execute_operation(AGENT_DELETE));
        } else {
            tasks.push(instance.send_event("Stopping agent"));
            tasks.push(instance.execute_operation(WORKER_INSTALLER_STOP));
            tasks.push(instance.send_event("Deleting agent"));
            tasks.push(instance.execute_operation(WORKER_INSTALLER_UNINSTALL));
        }
    }
    tasks
}
