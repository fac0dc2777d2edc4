//! Core abstractions for the brook workflow engine
//!
//! This crate provides the graph model, the node capability contract and the
//! dependency contracts every other crate builds on. It has no scheduling or
//! execution logic of its own.

pub mod deps;
mod error;
pub mod events;
mod node;
mod value;
mod workflow;

pub use deps::{
    Dependencies, FileMeta, FileStore, MemoryFileStore, MemoryStateStore, StateStore, StoredFile,
};
pub use error::{FlowError, NodeError, WorkflowError};
pub use events::*;
pub use node::{Node, NodeContext, NodeState, PortedNode};
pub use value::Value;
pub use workflow::{
    Edge, FanInStrategy, Inputs, Item, Items, NodeId, NodeSpec, Port, PortedItems, RetryPolicy,
    Workflow, WorkflowId, PORT_MAIN,
};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
