// ABOUTME: Task graph container and execution engine
// ABOUTME: Handles subgraph nesting, dependency edges, and concurrent scheduled execution

pub mod container;
pub mod engine;
pub mod error;

pub use container::{
    forkjoin, ElementId, FailedTask, Sequence, Step, Subgraph, SubgraphFailureHandler,
    SubgraphResolution, TaskGraph, Unit,
};
pub use engine::ExecutionEnv;
pub use error::GraphError;
