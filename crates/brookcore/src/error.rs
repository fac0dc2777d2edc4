use crate::NodeId;
use thiserror::Error;

/// Run-level failure. Any of these aborts the whole execution.
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Node {node_id} failed to initialize: {source}")]
    InitFailed {
        node_id: NodeId,
        #[source]
        source: NodeError,
    },

    #[error("wait_all: missing inputs for node {node_id}")]
    MissingInputs { node_id: NodeId },

    #[error("Node {node_id} failed after {attempts} attempt(s): {source}")]
    ProcessingFailed {
        node_id: NodeId,
        attempts: u32,
        #[source]
        source: NodeError,
    },

    #[error("Node {node_id} cancelled")]
    Cancelled { node_id: NodeId },

    #[error("Node {node_id} exceeded its deadline of {timeout_ms}ms")]
    DeadlineExceeded { node_id: NodeId, timeout_ms: u64 },

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FlowError {
    /// Node the failure is attributed to, when there is one.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            FlowError::InitFailed { node_id, .. }
            | FlowError::MissingInputs { node_id }
            | FlowError::ProcessingFailed { node_id, .. }
            | FlowError::Cancelled { node_id }
            | FlowError::DeadlineExceeded { node_id, .. } => Some(node_id),
            _ => None,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, FlowError::Cancelled { .. } | FlowError::DeadlineExceeded { .. })
    }
}

/// Failure reported by a node handler.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Node initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Timeout after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Cancelled")]
    Cancelled,
}

/// Static problems with a workflow definition, surfaced when a run starts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("Workflow not found: {0}")]
    NotFound(String),

    #[error("Invalid workflow: {0}")]
    Invalid(String),

    #[error("Cyclic dependency detected; unscheduled nodes: {}", unscheduled.join(", "))]
    CyclicDependency { unscheduled: Vec<NodeId> },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("Invalid connection: {0}")]
    InvalidConnection(String),
}
