use crate::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub type WorkflowId = String;
pub type NodeId = String;
pub type Port = String;

/// Default port used for unqualified data.
pub const PORT_MAIN: &str = "main";

/// An open key-value record; the unit of data flowing between nodes.
pub type Item = HashMap<String, Value>;
pub type Items = Vec<Item>;

/// Items keyed by output port.
pub type PortedItems = HashMap<Port, Items>;

/// Initial data (or an instance batch) keyed by the node that receives it.
pub type Inputs = HashMap<NodeId, Items>;

fn main_port() -> Port {
    PORT_MAIN.to_string()
}

/// Complete workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Workflow {
    pub fn new(id: impl Into<WorkflowId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn add_node(&mut self, node: NodeSpec) -> NodeId {
        let id = node.id.clone();
        self.nodes.push(node);
        id
    }

    pub fn connect(
        &mut self,
        from_node: impl Into<NodeId>,
        from_port: impl Into<Port>,
        to_node: impl Into<NodeId>,
        to_port: impl Into<Port>,
    ) {
        self.edges.push(Edge {
            from_node: from_node.into(),
            from_port: from_port.into(),
            to_node: to_node.into(),
            to_port: to_port.into(),
        });
    }

    /// Connect `main` to `main`.
    pub fn connect_main(&mut self, from_node: impl Into<NodeId>, to_node: impl Into<NodeId>) {
        self.connect(from_node, PORT_MAIN, to_node, PORT_MAIN);
    }

    pub fn find_node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Edges whose target is `id`.
    pub fn predecessors<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.to_node == id)
    }

    /// Edges whose source is `id`.
    pub fn successors<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.from_node == id)
    }
}

/// Node specification in a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub name: String,
    /// Worker bound for this node; 0 means engine default.
    #[serde(default)]
    pub concurrency: usize,
    /// Wall-clock bound in milliseconds; 0 means none.
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default)]
    pub config: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fan_in: Option<FanInStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
}

impl NodeSpec {
    pub fn new(id: impl Into<NodeId>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            name: String::new(),
            concurrency: 0,
            timeout_ms: 0,
            config: HashMap::new(),
            fan_in: None,
            retry_policy: None,
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, workers: usize) -> Self {
        self.concurrency = workers;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_fan_in(mut self, fan_in: FanInStrategy) -> Self {
        self.fan_in = Some(fan_in);
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

/// Directed edge between two node ports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from_node: NodeId,
    #[serde(default = "main_port")]
    pub from_port: Port,
    pub to_node: NodeId,
    #[serde(default = "main_port")]
    pub to_port: Port,
}

/// How a node combines items delivered by several predecessor edges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanInStrategy {
    /// Every delivery, in arrival order.
    #[default]
    Concat,
    /// Only the most recent delivery.
    Latest,
    /// Like `Concat`, but a node with predecessors must have received something.
    WaitAll,
}

/// Per-chunk retry policy with capped exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay_ms = base.as_millis() as u64;
        self.max_delay_ms = max.as_millis() as u64;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Fills zero delays with defaults and keeps `max_delay >= base_delay`.
    pub fn normalized(&self) -> Self {
        let defaults = Self::default();
        let mut policy = self.clone();
        if policy.base_delay_ms == 0 {
            policy.base_delay_ms = defaults.base_delay_ms;
        }
        if policy.max_delay_ms == 0 {
            policy.max_delay_ms = defaults.max_delay_ms;
        }
        policy.max_delay_ms = policy.max_delay_ms.max(policy.base_delay_ms);
        policy
    }
}
