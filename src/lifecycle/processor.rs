// ABOUTME: Wires per-instance lifecycle subgraphs into one dependency graph
// ABOUTME: Handles untouched neighbors through stubs and injected link operations

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::graph::{ElementId, GraphError, ExecutionEnv, TaskGraph};
use crate::lifecycle::install::install_node_instance_subgraph;
use crate::lifecycle::interfaces::{REL_ESTABLISH, REL_UNLINK};
use crate::lifecycle::uninstall::{uninstall_node_instance_subgraph, IgnoreFailureHandler};
use crate::node::NodeInstance;

/// Bring up `instances`, respecting dependencies among them and re-linking
/// against `intact` neighbors that stay untouched.
pub async fn install_node_instances(
    graph: &mut TaskGraph,
    instances: &[NodeInstance],
    intact: &[NodeInstance],
    env: &ExecutionEnv,
) -> Result<(), GraphError> {
    LifecycleProcessor::new(instances, intact)
        .install(graph, env)
        .await
}

/// Tear down `instances` in reverse dependency order, unlinking from
/// untouched `intact` neighbors.
pub async fn uninstall_node_instances(
    graph: &mut TaskGraph,
    instances: &[NodeInstance],
    intact: &[NodeInstance],
    env: &ExecutionEnv,
) -> Result<(), GraphError> {
    LifecycleProcessor::new(instances, intact)
        .uninstall(graph, env)
        .await
}

/// Tear down all of `instances`, then bring them all up again. Two full
/// passes over the set, so every dependent is gone before its dependency is
/// deleted, and dependencies are back up before their dependents.
pub async fn reinstall_node_instances(
    graph: &mut TaskGraph,
    instances: &[NodeInstance],
    intact: &[NodeInstance],
    env: &ExecutionEnv,
) -> Result<(), GraphError> {
    LifecycleProcessor::new(instances, intact)
        .reinstall(graph, env)
        .await
}

enum Pass {
    Install,
    Uninstall,
}

/// Builds the combined lifecycle graph for a set of affected instances.
///
/// Every affected instance gets its own lifecycle subgraph. Instances that
/// stay untouched but neighbor an affected one get an empty stub subgraph, so
/// dependency edges have something to attach to, plus injected establish or
/// unlink operations for the links that change.
pub struct LifecycleProcessor<'a> {
    node_instances: &'a [NodeInstance],
    intact_nodes: &'a [NodeInstance],
}

impl<'a> LifecycleProcessor<'a> {
    pub fn new(node_instances: &'a [NodeInstance], intact_nodes: &'a [NodeInstance]) -> Self {
        Self {
            node_instances,
            intact_nodes,
        }
    }

    pub async fn install(
        &self,
        graph: &mut TaskGraph,
        env: &ExecutionEnv,
    ) -> Result<(), GraphError> {
        self.build(graph, Pass::Install);
        graph.execute(env).await
    }

    pub async fn uninstall(
        &self,
        graph: &mut TaskGraph,
        env: &ExecutionEnv,
    ) -> Result<(), GraphError> {
        self.build(graph, Pass::Uninstall);
        graph.execute(env).await
    }

    /// Teardown runs to completion before any bring-up starts; a single
    /// combined graph cannot express that without the phases executing
    /// separately.
    pub async fn reinstall(
        &self,
        graph: &mut TaskGraph,
        env: &ExecutionEnv,
    ) -> Result<(), GraphError> {
        self.build(graph, Pass::Uninstall);
        graph.execute(env).await?;
        self.build(graph, Pass::Install);
        graph.execute(env).await
    }

    /// Build the graph without executing it.
    pub fn build_install(&self, graph: &mut TaskGraph) {
        self.build(graph, Pass::Install);
    }

    pub fn build_uninstall(&self, graph: &mut TaskGraph) {
        self.build(graph, Pass::Uninstall);
    }

    fn build(&self, graph: &mut TaskGraph, pass: Pass) {
        let mut subgraphs: HashMap<String, ElementId> = HashMap::new();
        for instance in self.node_instances {
            let subgraph = match pass {
                Pass::Install => install_node_instance_subgraph(instance, graph, None),
                Pass::Uninstall => uninstall_node_instance_subgraph(instance, graph, None),
            };
            subgraphs.insert(instance.id.clone(), subgraph);
        }
        for instance in self.intact_nodes {
            let stub = graph.subgraph(format!("stub_{}", instance.id));
            subgraphs.insert(instance.id.clone(), stub);
        }

        let install_direction = matches!(pass, Pass::Install);
        let affected: HashSet<&str> = self.node_instances.iter().map(|i| i.id.as_str()).collect();
        let intact: HashSet<&str> = self.intact_nodes.iter().map(|i| i.id.as_str()).collect();

        add_dependencies(
            graph,
            self.node_instances,
            &subgraphs,
            &affected,
            &intact,
            install_direction,
            false,
        );
        add_dependencies(
            graph,
            self.intact_nodes,
            &subgraphs,
            &affected,
            &intact,
            install_direction,
            true,
        );
    }
}

/// Wire relationship edges between instance subgraphs. A source depends on
/// its targets during bring-up; teardown reverses the direction so sources
/// are torn down first.
///
/// For intact sources the edge alone is not enough: the link to an affected
/// target changes, so the matching establish or unlink operations are
/// injected into the intact instance's stub subgraph.
#[allow(clippy::too_many_arguments)]
fn add_dependencies(
    graph: &mut TaskGraph,
    instances: &[NodeInstance],
    subgraphs: &HashMap<String, ElementId>,
    affected: &HashSet<&str>,
    intact: &HashSet<&str>,
    install_direction: bool,
    inject_link_operations: bool,
) {
    for instance in instances {
        let source = match subgraphs.get(&instance.id) {
            Some(&subgraph) => subgraph,
            None => continue,
        };
        for relationship in &instance.relationships {
            let target_id = relationship.target_id.as_str();
            let target_affected = affected.contains(target_id);
            if !target_affected && !intact.contains(target_id) {
                continue;
            }
            let target = match subgraphs.get(target_id) {
                Some(&subgraph) => subgraph,
                None => continue,
            };

            if install_direction {
                graph.add_dependency(source, target);
            } else {
                graph.add_dependency(target, source);
            }
            debug!(
                source = %relationship.source_id(),
                target = %target_id,
                install_direction,
                "wired relationship dependency"
            );

            if inject_link_operations && target_affected {
                let operation = if install_direction {
                    REL_ESTABLISH
                } else {
                    REL_UNLINK
                };
                let mut tasks = vec![
                    relationship.execute_source_operation(operation),
                    relationship.execute_target_operation(operation),
                ];
                if !install_direction {
                    let handler = IgnoreFailureHandler::new(instance);
                    tasks = tasks
                        .into_iter()
                        .map(|t| t.with_handler(handler.clone()))
                        .collect();
                }
                let mut previous = None;
                for task in tasks {
                    let element = graph.add_task_to(source, task);
                    if let Some(previous) = previous {
                        graph.add_dependency(element, previous);
                    }
                    previous = Some(element);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionConfig;
    use crate::lifecycle::interfaces::{LIFECYCLE_CREATE, LIFECYCLE_STOP};
    use crate::node::{Node, RuntimeChannel, WorkflowContext};
    use crate::tasks::TaskError;
    use std::sync::Arc;

    struct NullRuntime;

    impl RuntimeChannel for NullRuntime {
        fn set_instance_state(&self, _instance_id: &str, _state: &str) -> Result<(), TaskError> {
            Ok(())
        }

        fn send_event(&self, _instance_id: &str, _message: &str) {}
    }

    fn ctx() -> Arc<WorkflowContext> {
        WorkflowContext::new(Arc::new(NullRuntime), &ExecutionConfig::default())
    }

    fn plain_instance(id: &str, operations: &[&str]) -> NodeInstance {
        let node = Arc::new(Node {
            operations: operations.iter().map(|s| s.to_string()).collect(),
            ..Node::default()
        });
        NodeInstance::new(id, node, ctx())
    }

    fn find_subgraph(graph: &TaskGraph, name: &str) -> ElementId {
        let mut id = None;
        for element in graph.top_level_subgraphs() {
            if graph.subgraph_ref(element).map(|s| s.name.as_str()) == Some(name) {
                id = Some(element);
            }
        }
        id.unwrap_or_else(|| panic!("no subgraph named {name}"))
    }

    #[test]
    fn test_install_source_waits_for_target() {
        let db = plain_instance("db_1", &[LIFECYCLE_CREATE]);
        let mut web = plain_instance("web_1", &[LIFECYCLE_CREATE]);
        web.add_relationship(&db, HashSet::new());

        let mut graph = TaskGraph::new();
        LifecycleProcessor::new(&[web, db], &[]).build_install(&mut graph);

        let web_sub = find_subgraph(&graph, "install_web_1");
        let db_sub = find_subgraph(&graph, "install_db_1");
        assert!(graph.has_dependency(web_sub, db_sub));
        assert!(!graph.has_dependency(db_sub, web_sub));
    }

    #[test]
    fn test_uninstall_reverses_direction() {
        let db = plain_instance("db_1", &[LIFECYCLE_STOP]);
        let mut web = plain_instance("web_1", &[LIFECYCLE_STOP]);
        web.add_relationship(&db, HashSet::new());

        let mut graph = TaskGraph::new();
        LifecycleProcessor::new(&[web, db], &[]).build_uninstall(&mut graph);

        let web_sub = find_subgraph(&graph, "uninstall_web_1");
        let db_sub = find_subgraph(&graph, "uninstall_db_1");
        assert!(graph.has_dependency(db_sub, web_sub));
    }

    #[test]
    fn test_intact_neighbor_gets_stub_with_link_operations() {
        let db = plain_instance("db_1", &[LIFECYCLE_CREATE]);
        let mut app = plain_instance("app_1", &[]);
        app.add_relationship(&db, [REL_ESTABLISH.to_string()].into_iter().collect());

        let mut graph = TaskGraph::new();
        LifecycleProcessor::new(&[db], &[app]).build_install(&mut graph);

        let stub = find_subgraph(&graph, "stub_app_1");
        let names = graph.task_names(stub);
        assert_eq!(
            names,
            vec![REL_ESTABLISH.to_string(), REL_ESTABLISH.to_string()]
        );
        let db_sub = find_subgraph(&graph, "install_db_1");
        assert!(graph.has_dependency(stub, db_sub));
    }

    #[test]
    fn test_relationships_to_unrelated_instances_are_skipped() {
        let other = plain_instance("other_1", &[]);
        let mut web = plain_instance("web_1", &[LIFECYCLE_CREATE]);
        web.add_relationship(&other, HashSet::new());

        let mut graph = TaskGraph::new();
        LifecycleProcessor::new(&[web], &[]).build_install(&mut graph);

        let web_sub = find_subgraph(&graph, "install_web_1");
        assert!(graph.dependencies_of(web_sub).is_empty());
    }
}
