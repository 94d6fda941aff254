// ABOUTME: Lifecycle graph construction for deployment bring-up and teardown
// ABOUTME: Per-instance subgraphs, host provisioning, and failure recovery policy

pub mod host;
pub mod install;
pub mod interfaces;
pub mod processor;
pub mod uninstall;

pub use install::{install_node_instance_subgraph, reinstall_node_instance_subgraph};
pub use processor::{
    install_node_instances, reinstall_node_instances, uninstall_node_instances,
    LifecycleProcessor,
};
pub use uninstall::uninstall_node_instance_subgraph;
