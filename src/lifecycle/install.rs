// ABOUTME: Per-instance bring-up and re-run subgraph builders
// ABOUTME: Failed bring-up is retried as a whole-instance teardown plus bring-up

use std::sync::Arc;

use tracing::info;

use crate::graph::{
    forkjoin, ElementId, SubgraphFailureHandler, SubgraphResolution, TaskGraph, Unit,
};
use crate::lifecycle::host::{host_post_start, is_host_instance};
use crate::lifecycle::interfaces::*;
use crate::lifecycle::uninstall::uninstall_node_instance_subgraph;
use crate::node::NodeInstance;
use crate::tasks::TaskOutcome;

/// Build the bring-up subgraph for one instance: create, configure (with
/// relationship pre/postconfigure around it), start, host provisioning for
/// computes, then monitoring and relationship establish.
pub fn install_node_instance_subgraph(
    instance: &NodeInstance,
    graph: &mut TaskGraph,
    scope: Option<ElementId>,
) -> ElementId {
    let name = format!("install_{}", instance.id);
    let subgraph = match scope {
        Some(parent) => graph.nested_subgraph(parent, name),
        None => graph.subgraph(name),
    };

    {
        let mut seq = graph.sequence(subgraph);
        seq.add(instance.set_state("initializing"))
            .add(forkjoin(vec![
                instance.send_event("Creating node").into(),
                instance.set_state("creating").into(),
            ]))
            .add(instance.execute_operation(LIFECYCLE_CREATE))
            .add(instance.set_state("created"))
            .add(forkjoin(relationship_operations(instance, REL_PRECONFIGURE)))
            .add(forkjoin(vec![
                instance.set_state("configuring").into(),
                instance.send_event("Configuring node").into(),
            ]))
            .add(instance.execute_operation(LIFECYCLE_CONFIGURE))
            .add(instance.set_state("configured"))
            .add(forkjoin(relationship_operations(
                instance,
                REL_POSTCONFIGURE,
            )))
            .add(forkjoin(vec![
                instance.set_state("starting").into(),
                instance.send_event("Starting node").into(),
            ]))
            .add(instance.execute_operation(LIFECYCLE_START));

        if is_host_instance(instance) {
            for task in host_post_start(instance) {
                seq.add(task);
            }
        }

        let mut establish: Vec<Unit> = vec![instance.execute_operation(MONITORING_START).into()];
        establish.extend(relationship_operations(instance, REL_ESTABLISH));
        seq.add(forkjoin(establish))
            .add(instance.set_state("started"));
    }

    graph.set_on_failure(subgraph, InstallRecovery::new(instance));
    subgraph
}

/// Build a re-run subgraph: a failure event, full teardown, then a fresh
/// bring-up, in order.
pub fn reinstall_node_instance_subgraph(
    instance: &NodeInstance,
    graph: &mut TaskGraph,
    scope: Option<ElementId>,
) -> ElementId {
    let name = format!("reinstall_{}", instance.id);
    let subgraph = match scope {
        Some(parent) => graph.nested_subgraph(parent, name),
        None => graph.subgraph(name),
    };

    let uninstall = uninstall_node_instance_subgraph(instance, graph, Some(subgraph));
    let install = install_node_instance_subgraph(instance, graph, Some(subgraph));

    {
        let mut seq = graph.sequence(subgraph);
        seq.add(instance.send_event("Node lifecycle failed. Attempting to re-run node lifecycle"))
            .add(uninstall)
            .add(install);
    }

    graph.set_on_failure(subgraph, InstallRecovery::new(instance));
    subgraph
}

fn relationship_operations(instance: &NodeInstance, operation: &str) -> Vec<Unit> {
    let mut units = Vec::new();
    for relationship in &instance.relationships {
        units.push(relationship.execute_source_operation(operation).into());
        units.push(relationship.execute_target_operation(operation).into());
    }
    units
}

/// Recovery policy for a failed bring-up or re-run subgraph.
///
/// The failed subgraph's remaining tasks are discarded either way. At top
/// level the whole instance is re-run through a fresh re-run subgraph,
/// charged one retry against the graph's subgraph budget. Nested inside
/// another scope, the failure is resolved as ignored here and propagated to
/// the containing subgraph, which applies its own policy.
pub(crate) struct InstallRecovery {
    instance: NodeInstance,
}

impl InstallRecovery {
    pub(crate) fn new(instance: &NodeInstance) -> Arc<Self> {
        Arc::new(Self {
            instance: instance.clone(),
        })
    }
}

impl SubgraphFailureHandler for InstallRecovery {
    fn on_failure(&self, graph: &mut TaskGraph, subgraph: ElementId) -> SubgraphResolution {
        for element in graph.descendants(subgraph) {
            graph.remove_task(element);
        }

        match graph.containing_subgraph(subgraph) {
            None => {
                info!(instance = %self.instance.id, "re-running failed instance lifecycle");
                let retries = graph
                    .subgraph_ref(subgraph)
                    .map(|s| s.current_retries)
                    .unwrap_or(0);
                let replacement = reinstall_node_instance_subgraph(&self.instance, graph, None);
                if let Some(sub) = graph.subgraph_mut(replacement) {
                    sub.current_retries = retries + 1;
                }
                SubgraphResolution {
                    outcome: TaskOutcome::retry(),
                    replacement: Some(replacement),
                }
            }
            Some(parent) => {
                if let Some(failed) = graph
                    .subgraph_ref(subgraph)
                    .and_then(|s| s.failed_task.clone())
                {
                    graph.record_subgraph_failure(parent, failed);
                }
                SubgraphResolution {
                    outcome: TaskOutcome::ignore(),
                    replacement: None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionConfig;
    use crate::node::{Node, RuntimeChannel, WorkflowContext};
    use crate::tasks::TaskError;
    use std::collections::HashSet;

    struct NullRuntime;

    impl RuntimeChannel for NullRuntime {
        fn set_instance_state(&self, _instance_id: &str, _state: &str) -> Result<(), TaskError> {
            Ok(())
        }

        fn send_event(&self, _instance_id: &str, _message: &str) {}
    }

    fn instance(operations: &[&str]) -> NodeInstance {
        let node = Arc::new(Node {
            operations: operations.iter().map(|s| s.to_string()).collect::<HashSet<_>>(),
            ..Node::default()
        });
        let ctx = WorkflowContext::new(Arc::new(NullRuntime), &ExecutionConfig::default());
        NodeInstance::new("web_1", node, ctx)
    }

    #[test]
    fn test_install_sequence_order() {
        let mut graph = TaskGraph::new();
        let inst = instance(&[LIFECYCLE_CREATE, LIFECYCLE_CONFIGURE, LIFECYCLE_START]);
        let subgraph = install_node_instance_subgraph(&inst, &mut graph, None);
        let names = graph.task_names(subgraph);
        assert_eq!(names.first().unwrap(), "set_state.initializing");
        assert_eq!(names.last().unwrap(), "set_state.started");
        let create = names.iter().position(|n| n == LIFECYCLE_CREATE).unwrap();
        let configure = names.iter().position(|n| n == LIFECYCLE_CONFIGURE).unwrap();
        let start = names.iter().position(|n| n == LIFECYCLE_START).unwrap();
        assert!(create < configure && configure < start);
    }

    #[test]
    fn test_reinstall_is_event_then_teardown_then_bring_up() {
        let mut graph = TaskGraph::new();
        let inst = instance(&[LIFECYCLE_CREATE, LIFECYCLE_STOP]);
        let reinstall = reinstall_node_instance_subgraph(&inst, &mut graph, None);
        let uninstall = uninstall_node_instance_subgraph(&inst, &mut graph, None);
        let install = install_node_instance_subgraph(&inst, &mut graph, None);

        // Exactly the leading event, then the teardown sequence, then the
        // bring-up sequence.
        let mut expected = vec!["send_event".to_string()];
        expected.extend(graph.task_names(uninstall));
        expected.extend(graph.task_names(install));
        assert_eq!(graph.task_names(reinstall), expected);
    }

    #[test]
    fn test_top_level_failure_retries_as_reinstall() {
        let mut graph = TaskGraph::new();
        let inst = instance(&[LIFECYCLE_CREATE]);
        let subgraph = install_node_instance_subgraph(&inst, &mut graph, None);
        let handler = InstallRecovery::new(&inst);
        let resolution = handler.on_failure(&mut graph, subgraph);
        assert!(resolution.outcome.is_retry());
        let replacement = resolution.replacement.unwrap();
        assert_eq!(
            graph.subgraph_ref(replacement).unwrap().current_retries,
            1
        );
        assert!(graph
            .subgraph_ref(replacement)
            .unwrap()
            .name
            .starts_with("reinstall_"));
    }

    #[test]
    fn test_nested_failure_is_ignored_and_propagated() {
        let mut graph = TaskGraph::new();
        let inst = instance(&[LIFECYCLE_CREATE]);
        let parent = graph.subgraph("outer");
        let subgraph = install_node_instance_subgraph(&inst, &mut graph, Some(parent));
        let failed = crate::graph::FailedTask {
            task_id: "t-1".to_string(),
            name: LIFECYCLE_CREATE.to_string(),
            error: None,
        };
        graph.record_subgraph_failure(subgraph, failed.clone());

        let handler = InstallRecovery::new(&inst);
        let resolution = handler.on_failure(&mut graph, subgraph);
        assert_eq!(resolution.outcome, TaskOutcome::Ignore);
        assert!(resolution.replacement.is_none());
        let parent_sub = graph.subgraph_ref(parent).unwrap();
        assert_eq!(parent_sub.failed_task.as_ref().unwrap().name, failed.name);
    }

    #[test]
    fn test_recovery_discards_remaining_tasks() {
        let mut graph = TaskGraph::new();
        let inst = instance(&[LIFECYCLE_CREATE]);
        let subgraph = install_node_instance_subgraph(&inst, &mut graph, None);
        let handler = InstallRecovery::new(&inst);
        handler.on_failure(&mut graph, subgraph);
        assert!(graph.subgraph_ref(subgraph).unwrap().members.is_empty());
    }
}
