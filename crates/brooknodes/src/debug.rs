use async_trait::async_trait;
use brookcore::{Items, Node, NodeContext, NodeError, Value};
use brookruntime::{NodeFactory, NodeMetadata, PortDefinition};
use std::collections::HashMap;

/// Simple debug node that logs the items passing through it
pub struct DebugNode;

#[async_trait]
impl Node for DebugNode {
    fn node_type(&self) -> &str {
        "debug.log"
    }

    async fn process(&self, ctx: &NodeContext, input: Items) -> Result<Items, NodeError> {
        let prefix = ctx.config_str("prefix").unwrap_or("DEBUG");

        ctx.events.info(format!("{}: {} item(s)", prefix, input.len()));
        for (index, item) in input.iter().enumerate() {
            let rendered = serde_json::to_string(item)
                .map_err(|e| NodeError::ExecutionFailed(format!("cannot render item: {}", e)))?;
            tracing::info!(node_id = %ctx.node.id, index, "{}: {}", prefix, rendered);
        }

        Ok(input)
    }
}

pub struct DebugNodeFactory;

impl NodeFactory for DebugNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(DebugNode))
    }

    fn node_type(&self) -> &str {
        "debug.log"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Logs items for debugging".to_string(),
            category: "debug".to_string(),
            inputs: vec![PortDefinition::new("main", "Items to log")],
            outputs: vec![PortDefinition::new("main", "The same items")],
        }
    }
}
