use brookcore::{Node, NodeError, Value, WorkflowError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Factory trait for creating node instances
pub trait NodeFactory: Send + Sync {
    /// Create a fresh handler. Called once per node per execution.
    fn create(&self, config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError>;

    /// Get node type identifier
    fn node_type(&self) -> &str;

    /// Optional: Get node metadata (description, ports, etc.)
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::default()
    }
}

/// Metadata about a node type
#[derive(Debug, Clone)]
pub struct NodeMetadata {
    pub description: String,
    pub category: String,
    pub inputs: Vec<PortDefinition>,
    pub outputs: Vec<PortDefinition>,
}

impl Default for NodeMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PortDefinition {
    pub name: String,
    pub description: String,
    pub required: bool,
}

impl PortDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: false,
        }
    }
}

/// Adapts a plain constructor closure into a [`NodeFactory`].
pub struct FnFactory<F> {
    node_type: String,
    constructor: F,
}

impl<F> NodeFactory for FnFactory<F>
where
    F: Fn() -> Box<dyn Node> + Send + Sync,
{
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok((self.constructor)())
    }

    fn node_type(&self) -> &str {
        &self.node_type
    }
}

/// Registry of available node types.
///
/// Lookups take a shared lock and may run concurrently; registration is rare.
/// Registering a type twice replaces the earlier factory.
pub struct NodeRegistry {
    factories: RwLock<HashMap<String, Arc<dyn NodeFactory>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Register a node factory
    pub fn register(&self, factory: Arc<dyn NodeFactory>) {
        let node_type = factory.node_type().to_string();
        let previous = self.factories.write().insert(node_type.clone(), factory);
        if previous.is_some() {
            tracing::debug!(node_type = %node_type, "Replacing registered node type");
        } else {
            tracing::debug!(node_type = %node_type, "Registering node type");
        }
    }

    /// Register a constructor closure under `node_type`.
    pub fn register_fn<F>(&self, node_type: impl Into<String>, constructor: F)
    where
        F: Fn() -> Box<dyn Node> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnFactory {
            node_type: node_type.into(),
            constructor,
        }));
    }

    /// Create a node instance from a node type and config
    pub fn create_node(
        &self,
        node_type: &str,
        config: &HashMap<String, Value>,
    ) -> Result<Box<dyn Node>, WorkflowError> {
        let factory = self
            .factories
            .read()
            .get(node_type)
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownNodeType(node_type.to_string()))?;

        factory
            .create(config)
            .map_err(|e| WorkflowError::Invalid(format!("Failed to create node '{}': {}", node_type, e)))
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.factories.read().contains_key(node_type)
    }

    /// Get all registered node types, sorted
    pub fn list_node_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// Get metadata for a node type
    pub fn get_metadata(&self, node_type: &str) -> Option<NodeMetadata> {
        self.factories.read().get(node_type).map(|f| f.metadata())
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Named(&'static str);

    #[async_trait]
    impl Node for Named {
        fn node_type(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn later_registration_replaces_earlier() {
        let registry = NodeRegistry::new();
        registry.register_fn("thing", || Box::new(Named("first")));
        registry.register_fn("thing", || Box::new(Named("second")));

        let node = registry.create_node("thing", &HashMap::new()).unwrap();
        assert_eq!(node.node_type(), "second");
        assert_eq!(registry.list_node_types(), vec!["thing"]);
    }

    #[test]
    fn unknown_type_is_reported() {
        let registry = NodeRegistry::new();
        assert!(!registry.contains("missing"));
        assert!(matches!(
            registry.create_node("missing", &HashMap::new()),
            Err(WorkflowError::UnknownNodeType(t)) if t == "missing"
        ));
    }
}
