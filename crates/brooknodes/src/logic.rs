use async_trait::async_trait;
use brookcore::{Items, Node, NodeContext, NodeError, PortedItems, PortedNode, Value, PORT_MAIN};
use brookruntime::{NodeFactory, NodeMetadata, PortDefinition};
use std::collections::HashMap;

pub const PORT_TRUE: &str = "true";
pub const PORT_FALSE: &str = "false";

/// Routes each item to `true` or `false` by testing one of its fields.
///
/// Config:
/// - `field`: item key to test (required)
/// - `equals`: value to compare against; without it the field's truthiness decides
pub struct IfNode;

#[async_trait]
impl Node for IfNode {
    fn node_type(&self) -> &str {
        "logic.if"
    }

    fn ported(&self) -> Option<&dyn PortedNode> {
        Some(self)
    }
}

#[async_trait]
impl PortedNode for IfNode {
    async fn process_ported(&self, ctx: &NodeContext, input: Items) -> Result<PortedItems, NodeError> {
        let field = ctx.require_config("field")?.as_str().ok_or_else(|| NodeError::InvalidInputType {
            field: "field".to_string(),
            expected: "string".to_string(),
            actual: "other".to_string(),
        })?;
        let expected = ctx.config().get("equals");

        let mut matched = Items::new();
        let mut rest = Items::new();
        for item in &input {
            let value = item.get(field).unwrap_or(&Value::Null);
            let passes = match expected {
                Some(expected) => value == expected,
                None => value.is_truthy(),
            };
            if passes {
                matched.push(item.clone());
            } else {
                rest.push(item.clone());
            }
        }

        tracing::debug!(
            node_id = %ctx.node.id,
            matched = matched.len(),
            rest = rest.len(),
            "Routed items"
        );

        Ok(HashMap::from([
            (PORT_TRUE.to_string(), matched),
            (PORT_FALSE.to_string(), rest),
            (PORT_MAIN.to_string(), input),
        ]))
    }
}

pub struct IfNodeFactory;

impl NodeFactory for IfNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(IfNode))
    }

    fn node_type(&self) -> &str {
        "logic.if"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Route items by a field test".to_string(),
            category: "logic".to_string(),
            inputs: vec![PortDefinition::new("main", "Items to test")],
            outputs: vec![
                PortDefinition::new(PORT_TRUE, "Items that passed"),
                PortDefinition::new(PORT_FALSE, "Items that failed"),
                PortDefinition::new(PORT_MAIN, "Every input item"),
            ],
        }
    }
}
