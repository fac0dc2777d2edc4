use async_trait::async_trait;
use brookcore::{Items, Node, NodeContext, NodeError, Value};
use brookruntime::{NodeFactory, NodeMetadata, PortDefinition};
use std::collections::HashMap;

/// Copies items through, stamping each with the configured label.
pub struct EchoNode;

#[async_trait]
impl Node for EchoNode {
    fn node_type(&self) -> &str {
        "echo"
    }

    async fn process(&self, ctx: &NodeContext, input: Items) -> Result<Items, NodeError> {
        let label = ctx.config_str("label").unwrap_or_default().to_string();
        Ok(input
            .into_iter()
            .map(|mut item| {
                item.insert("echo_label".to_string(), Value::String(label.clone()));
                item
            })
            .collect())
    }
}

pub struct EchoNodeFactory;

impl NodeFactory for EchoNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(EchoNode))
    }

    fn node_type(&self) -> &str {
        "echo"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Pass items through, adding echo_label from config".to_string(),
            category: "core".to_string(),
            inputs: vec![PortDefinition::new("main", "Items to echo")],
            outputs: vec![PortDefinition::new("main", "Items with echo_label set")],
        }
    }
}

/// Pass-through; the engine's fan-in strategy does the merging.
pub struct MergeNode;

#[async_trait]
impl Node for MergeNode {
    fn node_type(&self) -> &str {
        "merge"
    }

    async fn process(&self, _ctx: &NodeContext, input: Items) -> Result<Items, NodeError> {
        Ok(input)
    }
}

pub struct MergeNodeFactory;

impl NodeFactory for MergeNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(MergeNode))
    }

    fn node_type(&self) -> &str {
        "merge"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Join several branches into one stream".to_string(),
            category: "core".to_string(),
            inputs: vec![PortDefinition::new("main", "Items from every predecessor")],
            outputs: vec![PortDefinition::new("main", "Combined items")],
        }
    }
}
