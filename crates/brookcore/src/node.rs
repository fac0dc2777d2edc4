use crate::deps::Dependencies;
use crate::events::{EventEmitter, ExecutionId};
use crate::{Items, NodeError, NodeSpec, PortedItems, Value, Workflow, PORT_MAIN};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Core trait that all executable nodes implement
#[async_trait]
pub trait Node: Send + Sync {
    /// Type tag this handler is registered under (e.g. "echo", "logic.if")
    fn node_type(&self) -> &str;

    /// Called once per node per execution, before any processing call.
    ///
    /// The engine abandons the call as soon as `ctx` is cancelled or its
    /// deadline passes.
    async fn initialize(&mut self, _ctx: &NodeContext, _deps: &Dependencies) -> Result<(), NodeError> {
        Ok(())
    }

    /// Process one chunk of input. All output lands on the `main` port.
    ///
    /// The default delegates to [`PortedNode::process_ported`] and keeps the
    /// `main` port, so handlers that only route by port need not implement it.
    async fn process(&self, ctx: &NodeContext, input: Items) -> Result<Items, NodeError> {
        match self.ported() {
            Some(ported) => {
                let mut out = ported.process_ported(ctx, input).await?;
                Ok(out.remove(PORT_MAIN).unwrap_or_default())
            }
            None => Err(NodeError::Configuration(format!(
                "node type '{}' implements neither process nor process_ported",
                self.node_type()
            ))),
        }
    }

    /// Multi-port capability. The engine prefers it when present.
    fn ported(&self) -> Option<&dyn PortedNode> {
        None
    }
}

/// Extended contract for nodes that emit on several ports (branching, routing).
#[async_trait]
pub trait PortedNode: Send + Sync {
    async fn process_ported(&self, ctx: &NodeContext, input: Items)
        -> Result<PortedItems, NodeError>;
}

/// Execution context passed to each processing call
#[derive(Clone)]
pub struct NodeContext {
    pub execution_id: ExecutionId,

    pub workflow: Arc<Workflow>,

    pub node: Arc<NodeSpec>,

    /// Child of the run's token; cancelled when the run is cancelled or a
    /// sibling chunk fails.
    pub cancellation: CancellationToken,

    /// Set when the node has a timeout.
    pub deadline: Option<Instant>,

    /// Event emitter for real-time updates
    pub events: EventEmitter,
}

impl NodeContext {
    pub fn new(
        execution_id: ExecutionId,
        workflow: Arc<Workflow>,
        node: Arc<NodeSpec>,
        cancellation: CancellationToken,
        events: EventEmitter,
    ) -> Self {
        let deadline = node.timeout().map(|timeout| Instant::now() + timeout);
        Self {
            execution_id,
            workflow,
            node,
            cancellation,
            deadline,
            events,
        }
    }

    pub fn config(&self) -> &HashMap<String, Value> {
        &self.node.config
    }

    /// Get config value or return error
    pub fn require_config(&self, name: &str) -> Result<&Value, NodeError> {
        self.node
            .config
            .get(name)
            .ok_or_else(|| NodeError::Configuration(format!("Missing config: {}", name)))
    }

    /// Get config with default
    pub fn get_config_or(&self, name: &str, default: Value) -> Value {
        self.node.config.get(name).cloned().unwrap_or(default)
    }

    pub fn config_str(&self, name: &str) -> Option<&str> {
        self.node.config.get(name).and_then(Value::as_str)
    }

    /// The context's error, if it is already cancelled or past its deadline.
    pub fn check(&self) -> Result<(), NodeError> {
        if self.cancellation.is_cancelled() {
            return Err(NodeError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(self.timeout_error()),
            _ => Ok(()),
        }
    }

    /// Resolves with the context's error once it is cancelled or expires.
    pub async fn done(&self) -> NodeError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancellation.cancelled() => NodeError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => self.timeout_error(),
            },
            None => {
                self.cancellation.cancelled().await;
                NodeError::Cancelled
            }
        }
    }

    fn timeout_error(&self) -> NodeError {
        NodeError::Timeout {
            millis: self.node.timeout_ms,
        }
    }
}

/// Persistent state for a node, stored through [`crate::StateStore`]
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub data: HashMap<String, Value>,
}
