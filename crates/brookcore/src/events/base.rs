use crate::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

pub type ExecutionId = String;

/// Events emitted during workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    NodeStarted {
        execution_id: ExecutionId,
        node_id: NodeId,
        node_type: String,
        timestamp: DateTime<Utc>,
    },
    NodeCompleted {
        execution_id: ExecutionId,
        node_id: NodeId,
        /// Items produced on the `main` port.
        count: usize,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeFailed {
        execution_id: ExecutionId,
        node_id: NodeId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    ExecutionCompleted {
        execution_id: ExecutionId,
        at: DateTime<Utc>,
    },
    NodeEvent {
        execution_id: ExecutionId,
        node_id: NodeId,
        event: NodeEvent,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            ExecutionEvent::NodeStarted { .. } => "node_started",
            ExecutionEvent::NodeCompleted { .. } => "node_completed",
            ExecutionEvent::NodeFailed { .. } => "node_failed",
            ExecutionEvent::ExecutionCompleted { .. } => "execution_completed",
            ExecutionEvent::NodeEvent { .. } => "node_event",
        }
    }

    pub fn execution_id(&self) -> &str {
        match self {
            ExecutionEvent::NodeStarted { execution_id, .. }
            | ExecutionEvent::NodeCompleted { execution_id, .. }
            | ExecutionEvent::NodeFailed { execution_id, .. }
            | ExecutionEvent::ExecutionCompleted { execution_id, .. }
            | ExecutionEvent::NodeEvent { execution_id, .. } => execution_id,
        }
    }
}

/// Events specific to node execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum NodeEvent {
    Info { message: String },
    Warning { message: String },
    Progress { percent: f64, message: Option<String> },
}

/// Fire-and-forget sink for execution events.
pub trait EventBus: Send + Sync {
    fn emit(&self, event: ExecutionEvent);
}

/// Event emitter handed to nodes for real-time updates
#[derive(Clone)]
pub struct EventEmitter {
    execution_id: ExecutionId,
    node_id: NodeId,
    bus: Arc<dyn EventBus>,
}

impl EventEmitter {
    pub fn new(execution_id: ExecutionId, node_id: NodeId, bus: Arc<dyn EventBus>) -> Self {
        Self {
            execution_id,
            node_id,
            bus,
        }
    }

    /// Emit a node-specific event
    pub fn emit(&self, event: NodeEvent) {
        self.bus.emit(ExecutionEvent::NodeEvent {
            execution_id: self.execution_id.clone(),
            node_id: self.node_id.clone(),
            event,
            timestamp: Utc::now(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(NodeEvent::Info {
            message: message.into(),
        });
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(NodeEvent::Warning {
            message: message.into(),
        });
    }

    pub fn progress(&self, percent: f64, message: Option<String>) {
        self.emit(NodeEvent::Progress { percent, message });
    }
}

/// In-process bus backed by a tokio broadcast channel.
///
/// Emitting with no subscribers is not an error; lagging subscribers lose the
/// oldest events.
pub struct BroadcastEventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl EventBus for BroadcastEventBus {
    fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventBus;

impl EventBus for NullEventBus {
    fn emit(&self, _event: ExecutionEvent) {}
}
