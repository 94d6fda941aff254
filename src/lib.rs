// ABOUTME: Main library module for the convoy orchestration core
// ABOUTME: Exports all core modules and provides the public API

pub mod config;
pub mod graph;
pub mod lifecycle;
pub mod node;
pub mod tasks;

// Re-export commonly used types
pub use config::ExecutionConfig;
pub use graph::{ExecutionEnv, GraphError, TaskGraph};
pub use lifecycle::{
    install_node_instances, reinstall_node_instances, uninstall_node_instances,
    LifecycleProcessor,
};
pub use node::{Node, NodeInstance, Plugin, Relationship, RuntimeChannel, WorkflowContext};
pub use tasks::{
    RegistrationCache, Task, TaskError, TaskHandler, TaskOutcome, TaskState, WorkerGateway,
};

// Error handling
pub type Result<T> = anyhow::Result<T>;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
