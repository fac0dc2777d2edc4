use async_trait::async_trait;
use brookcore::{Item, Items, Node, NodeContext, NodeError, Value};
use brookruntime::{NodeFactory, NodeMetadata, PortDefinition};
use reqwest::Method;
use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: f64 = 15.0;

/// HTTP request node, one request per item.
///
/// Config:
/// - `url`: target, with `{{key}}` placeholders filled from the item (required)
/// - `method`: defaults to `GET`
/// - `headers`: object of string values
/// - `body_field`: item key whose value is sent as the JSON body
/// - `timeout_secs`: per-request timeout, default 15
pub struct HttpRequestNode {
    client: reqwest::Client,
}

impl HttpRequestNode {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpRequestNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Node for HttpRequestNode {
    fn node_type(&self) -> &str {
        "http.request"
    }

    async fn process(&self, ctx: &NodeContext, input: Items) -> Result<Items, NodeError> {
        let url_template = ctx.require_config("url")?.as_str().ok_or_else(|| NodeError::InvalidInputType {
            field: "url".to_string(),
            expected: "string".to_string(),
            actual: "other".to_string(),
        })?;
        let method_name = ctx.config_str("method").unwrap_or("GET").to_uppercase();
        let method = Method::from_bytes(method_name.as_bytes())
            .map_err(|_| NodeError::Configuration(format!("Unsupported method: {}", method_name)))?;
        let timeout_secs = ctx
            .config()
            .get("timeout_secs")
            .and_then(Value::as_f64)
            .filter(|secs| *secs > 0.0)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        let timeout = Duration::try_from_secs_f64(timeout_secs).map_err(|e| {
            NodeError::Configuration(format!("Invalid timeout_secs {}: {}", timeout_secs, e))
        })?;
        let headers = ctx.config().get("headers").and_then(Value::as_object);
        let body_field = ctx.config_str("body_field");

        let mut out = Items::with_capacity(input.len());
        for item in &input {
            ctx.check()?;
            let url = render(url_template, item);
            ctx.events.info(format!("{} {}", method, url));

            let mut request = self
                .client
                .request(method.clone(), &url)
                .timeout(timeout);
            if let Some(headers) = headers {
                for (key, value) in headers {
                    if let Some(value) = value.as_str() {
                        request = request.header(key.as_str(), value);
                    }
                }
            }
            if let Some(body) = body_field.and_then(|field| item.get(field)) {
                request = request.json(body);
            }

            let response = request
                .send()
                .await
                .map_err(|e| NodeError::ExecutionFailed(format!("HTTP request failed: {}", e)))?;
            let status = response.status().as_u16();
            let text = response
                .text()
                .await
                .map_err(|e| NodeError::ExecutionFailed(format!("Failed to read response: {}", e)))?;
            let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

            tracing::debug!(node_id = %ctx.node.id, url = %url, status, "HTTP response");

            out.push(Item::from([
                ("status".to_string(), Value::from(status as u64)),
                ("body".to_string(), body),
                ("url".to_string(), Value::String(url)),
                ("node_id".to_string(), Value::String(ctx.node.id.clone())),
            ]));
        }

        Ok(out)
    }
}

/// Replace `{{key}}` placeholders with the item's values. Unknown keys render
/// as the empty string.
pub(crate) fn render(template: &str, item: &Item) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        rendered.push_str(&rest[..start]);
        let key = rest[start + 2..start + 2 + len].trim();
        if let Some(value) = item.get(key) {
            rendered.push_str(&display(value));
        }
        rest = &rest[start + 2 + len + 2..];
    }
    rendered.push_str(rest);
    rendered
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

pub struct HttpRequestNodeFactory;

impl NodeFactory for HttpRequestNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(HttpRequestNode::new()))
    }

    fn node_type(&self) -> &str {
        "http.request"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Make one HTTP request per item".to_string(),
            category: "http".to_string(),
            inputs: vec![PortDefinition::new("main", "Items supplying url placeholders and bodies")],
            outputs: vec![PortDefinition::new("main", "status, body, url and node_id per request")],
        }
    }
}
