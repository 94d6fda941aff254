// ABOUTME: Per-instance teardown subgraph builder
// ABOUTME: Teardown is best-effort; every step logs and ignores its failures

use std::sync::Arc;

use crate::graph::{forkjoin, ElementId, TaskGraph, Unit};
use crate::lifecycle::host::{host_pre_stop, is_host_instance};
use crate::lifecycle::interfaces::*;
use crate::node::NodeInstance;
use crate::tasks::{Task, TaskHandler, TaskOutcome};

/// Logs the failure as an instance event and resolves the task as ignored,
/// so teardown keeps going past broken steps.
pub(crate) struct IgnoreFailureHandler {
    instance: NodeInstance,
}

impl IgnoreFailureHandler {
    pub(crate) fn new(instance: &NodeInstance) -> Arc<Self> {
        Arc::new(Self {
            instance: instance.clone(),
        })
    }
}

impl TaskHandler for IgnoreFailureHandler {
    fn on_failure(&self, task: &Task) -> TaskOutcome {
        self.instance
            .notify(&format!("Ignoring task {} failure", task.name));
        TaskOutcome::ignore()
    }
}

/// Build the teardown subgraph for one instance: monitoring stop, host agent
/// removal for computes, `lifecycle.stop`, unlink of outgoing relationships,
/// then `lifecycle.delete`.
pub fn uninstall_node_instance_subgraph(
    instance: &NodeInstance,
    graph: &mut TaskGraph,
    scope: Option<ElementId>,
) -> ElementId {
    let name = format!("uninstall_{}", instance.id);
    let subgraph = match scope {
        Some(parent) => graph.nested_subgraph(parent, name),
        None => graph.subgraph(name),
    };

    {
        let mut seq = graph.sequence(subgraph);
        seq.add(instance.set_state("stopping"))
            .add(instance.send_event("Stopping node"))
            .add(instance.execute_operation(MONITORING_STOP));
        if is_host_instance(instance) {
            for task in host_pre_stop(instance) {
                seq.add(task);
            }
        }
        seq.add(instance.execute_operation(LIFECYCLE_STOP))
            .add(instance.set_state("stopped"))
            .add(forkjoin(unlink_operations(instance)))
            .add(instance.set_state("deleting"))
            .add(instance.send_event("Deleting node"))
            .add(instance.execute_operation(LIFECYCLE_DELETE))
            .add(instance.set_state("deleted"));
    }

    let handler = IgnoreFailureHandler::new(instance);
    graph.set_failure_handler_on_tasks(subgraph, handler);
    subgraph
}

fn unlink_operations(instance: &NodeInstance) -> Vec<Unit> {
    let mut units = Vec::new();
    for relationship in &instance.relationships {
        units.push(relationship.execute_source_operation(REL_UNLINK).into());
        units.push(relationship.execute_target_operation(REL_UNLINK).into());
    }
    units
}
