use async_trait::async_trait;
use brookcore::{Items, Node, NodeContext, NodeError, Value};
use brookruntime::{NodeFactory, NodeMetadata, PortDefinition};
use std::collections::HashMap;
use tokio::time::{sleep, Duration};

const DEFAULT_DELAY_MS: u64 = 1000;

/// Delay items for a configured duration
pub struct DelayNode;

#[async_trait]
impl Node for DelayNode {
    fn node_type(&self) -> &str {
        "time.delay"
    }

    async fn process(&self, ctx: &NodeContext, input: Items) -> Result<Items, NodeError> {
        let delay_ms = ctx
            .config()
            .get("delay_ms")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_DELAY_MS);

        ctx.events.info(format!("Delaying for {}ms", delay_ms));

        tokio::select! {
            err = ctx.done() => Err(err),
            _ = sleep(Duration::from_millis(delay_ms)) => Ok(input),
        }
    }
}

pub struct DelayNodeFactory;

impl NodeFactory for DelayNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(DelayNode))
    }

    fn node_type(&self) -> &str {
        "time.delay"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Delay items for delay_ms milliseconds".to_string(),
            category: "time".to_string(),
            inputs: vec![PortDefinition::new("main", "Items to hold back")],
            outputs: vec![PortDefinition::new("main", "The same items, later")],
        }
    }
}
