use crate::http::render;
use async_trait::async_trait;
use brookcore::{
    Dependencies, FileStore, Items, Node, NodeContext, NodeError, StateStore, Value,
};
use brookruntime::{NodeFactory, NodeMetadata, PortDefinition};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Key in the writer's node state listing every file id it stored.
pub const WRITTEN_FILES_KEY: &str = "written_files";

fn not_initialized(node_type: &str) -> NodeError {
    NodeError::Configuration(format!("{} used before initialize", node_type))
}

/// Stores an item field as a file in the workflow's file store.
///
/// Config:
/// - `name_template`: file name with `{{key}}` placeholders (required)
/// - `field`: item key holding the contents, default `body`. Strings are
///   stored as-is, anything else as JSON
/// - `media_type`: defaults to `text/plain` for strings and
///   `application/json` otherwise
///
/// Adds `file_id` and `file_name` to each item.
#[derive(Default)]
pub struct FileWriteNode {
    files: Option<Arc<dyn FileStore>>,
    state: Option<Arc<dyn StateStore>>,
    manifest: Mutex<()>,
}

impl FileWriteNode {
    async fn record(&self, ctx: &NodeContext, ids: Vec<String>) -> Result<(), NodeError> {
        let state = self.state.as_ref().ok_or_else(|| not_initialized("files.write"))?;
        let _guard = self.manifest.lock().await;

        let mut current = state.load_node_state(&ctx.execution_id, &ctx.node.id).await?;
        let written = current
            .data
            .entry(WRITTEN_FILES_KEY.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(list) = written {
            list.extend(ids.into_iter().map(Value::String));
        }
        state
            .save_node_state(&ctx.execution_id, &ctx.node.id, current)
            .await
    }
}

#[async_trait]
impl Node for FileWriteNode {
    fn node_type(&self) -> &str {
        "files.write"
    }

    async fn initialize(&mut self, _ctx: &NodeContext, deps: &Dependencies) -> Result<(), NodeError> {
        self.files = Some(deps.files.clone());
        self.state = Some(deps.state.clone());
        Ok(())
    }

    async fn process(&self, ctx: &NodeContext, input: Items) -> Result<Items, NodeError> {
        let files = self.files.as_ref().ok_or_else(|| not_initialized("files.write"))?;
        let template = ctx.require_config("name_template")?.as_str().ok_or_else(|| {
            NodeError::Configuration("name_template must be a string".to_string())
        })?;
        let field = ctx.config_str("field").unwrap_or("body");
        let media_override = ctx.config_str("media_type");

        let mut out = Items::with_capacity(input.len());
        let mut ids = Vec::with_capacity(input.len());
        for mut item in input {
            ctx.check()?;
            let name = render(template, &item);
            if name.is_empty() {
                return Err(NodeError::Configuration(format!(
                    "name_template '{}' rendered an empty file name",
                    template
                )));
            }

            let (contents, media_type) = match item.get(field) {
                Some(Value::String(text)) => (text.clone().into_bytes(), "text/plain"),
                Some(other) => (
                    serde_json::to_vec(other)
                        .map_err(|e| NodeError::ExecutionFailed(format!("Failed to encode {}: {}", field, e)))?,
                    "application/json",
                ),
                None => return Err(NodeError::MissingInput(field.to_string())),
            };
            let media_type = media_override.unwrap_or(media_type);

            let id = files.put(&ctx.workflow.id, &name, contents, media_type).await?;
            tracing::debug!(node_id = %ctx.node.id, file_id = %id, name = %name, "Stored file");

            item.insert("file_id".to_string(), Value::String(id.clone()));
            item.insert("file_name".to_string(), Value::String(name));
            ids.push(id);
            out.push(item);
        }

        if !ids.is_empty() {
            self.record(ctx, ids).await?;
        }
        Ok(out)
    }
}

/// Loads the file named by an item field from the workflow's file store.
///
/// Config:
/// - `file_id_field`: default `file_id`
/// - `out_prefix`: default `file_`
///
/// Adds `<prefix>name`, `<prefix>media_type`, `<prefix>size` and
/// `<prefix>text` (UTF-8, lossy). JSON files also get `<prefix>content`.
#[derive(Default)]
pub struct FileLoadNode {
    files: Option<Arc<dyn FileStore>>,
}

#[async_trait]
impl Node for FileLoadNode {
    fn node_type(&self) -> &str {
        "files.load"
    }

    async fn initialize(&mut self, _ctx: &NodeContext, deps: &Dependencies) -> Result<(), NodeError> {
        self.files = Some(deps.files.clone());
        Ok(())
    }

    async fn process(&self, ctx: &NodeContext, input: Items) -> Result<Items, NodeError> {
        let files = self.files.as_ref().ok_or_else(|| not_initialized("files.load"))?;
        let id_field = ctx.config_str("file_id_field").unwrap_or("file_id");
        let prefix = ctx.config_str("out_prefix").unwrap_or("file_");

        let mut out = Items::with_capacity(input.len());
        for mut item in input {
            ctx.check()?;
            let file_id = item
                .get(id_field)
                .and_then(Value::as_str)
                .ok_or_else(|| NodeError::MissingInput(id_field.to_string()))?
                .to_string();
            let file = files.get(&ctx.workflow.id, &file_id).await?;

            let text = String::from_utf8_lossy(&file.contents).into_owned();
            if file.meta.media_type == "application/json" {
                let content = serde_json::from_str::<Value>(&text)
                    .map_err(|e| NodeError::ExecutionFailed(format!("File {} is not valid JSON: {}", file_id, e)))?;
                item.insert(format!("{}content", prefix), content);
            }
            item.insert(format!("{}name", prefix), Value::String(file.meta.name));
            item.insert(format!("{}media_type", prefix), Value::String(file.meta.media_type));
            item.insert(format!("{}size", prefix), Value::from(file.meta.size));
            item.insert(format!("{}text", prefix), Value::String(text));
            out.push(item);
        }

        Ok(out)
    }
}

pub struct FileWriteNodeFactory;

impl NodeFactory for FileWriteNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(FileWriteNode::default()))
    }

    fn node_type(&self) -> &str {
        "files.write"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Store an item field in the workflow's file store".to_string(),
            category: "files".to_string(),
            inputs: vec![PortDefinition::new("main", "Items carrying file contents")],
            outputs: vec![PortDefinition::new("main", "Items with file_id and file_name")],
        }
    }
}

pub struct FileLoadNodeFactory;

impl NodeFactory for FileLoadNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(FileLoadNode::default()))
    }

    fn node_type(&self) -> &str {
        "files.load"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Attach a stored file's contents to each item".to_string(),
            category: "files".to_string(),
            inputs: vec![PortDefinition::new("main", "Items carrying a file id")],
            outputs: vec![PortDefinition::new("main", "Items with file fields attached")],
        }
    }
}
