//! Workflow execution runtime
//!
//! This crate provides the engine that runs workflows: the node registry,
//! the topological scheduler, the chunked executor with retries, and the
//! instance manager that feeds long-lived workflows from a queue.

mod executor;
mod instance;
mod loader;
mod registry;
pub mod retry;
mod runtime;
pub mod scheduler;

pub use executor::{
    chunk, CyclePolicy, ExecutionResult, ExecutorConfig, NodeRuntimeOptions, WorkflowExecutor,
};
pub use instance::{
    Instance, InstanceConfig, InstanceError, InstanceId, InstanceManager, InstanceState,
    InstanceSummary,
};
pub use loader::WorkflowFile;
pub use registry::{NodeFactory, NodeMetadata, NodeRegistry, PortDefinition};
pub use runtime::{Runtime, RuntimeConfig};
pub use scheduler::{schedule, Schedule};
