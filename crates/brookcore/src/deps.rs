//! Capabilities injected into node handlers.
//!
//! The engine only depends on these contracts. The in-memory implementations
//! here back tests, the CLI and the instance manager.

use crate::events::{EventBus, NullEventBus};
use crate::{ExecutionId, NodeError, NodeState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Cross-run memory for node handlers. The engine never calls it directly.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save_node_state(
        &self,
        execution_id: &str,
        node_id: &str,
        state: NodeState,
    ) -> Result<(), NodeError>;

    /// Returns an empty state when nothing was saved.
    async fn load_node_state(&self, execution_id: &str, node_id: &str)
        -> Result<NodeState, NodeError>;
}

/// Named blobs scoped by workflow id.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn put(
        &self,
        workflow_id: &str,
        filename: &str,
        contents: Vec<u8>,
        media_type: &str,
    ) -> Result<String, NodeError>;

    async fn get(&self, workflow_id: &str, file_id: &str) -> Result<StoredFile, NodeError>;

    async fn list(&self, workflow_id: &str) -> Result<Vec<FileMeta>, NodeError>;

    async fn delete(&self, workflow_id: &str, file_id: &str) -> Result<(), NodeError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMeta {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub media_type: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredFile {
    pub meta: FileMeta,
    pub contents: Vec<u8>,
}

/// Dependency bundle passed to `Node::initialize`.
#[derive(Clone)]
pub struct Dependencies {
    pub state: Arc<dyn StateStore>,
    pub events: Arc<dyn EventBus>,
    pub files: Arc<dyn FileStore>,
}

impl Dependencies {
    pub fn new(
        state: Arc<dyn StateStore>,
        events: Arc<dyn EventBus>,
        files: Arc<dyn FileStore>,
    ) -> Self {
        Self {
            state,
            events,
            files,
        }
    }

    /// In-memory stores with the given event bus.
    pub fn in_memory(events: Arc<dyn EventBus>) -> Self {
        Self::new(
            Arc::new(MemoryStateStore::default()),
            events,
            Arc::new(MemoryFileStore::default()),
        )
    }
}

impl Default for Dependencies {
    fn default() -> Self {
        Self::in_memory(Arc::new(NullEventBus))
    }
}

#[derive(Default)]
pub struct MemoryStateStore {
    states: RwLock<HashMap<ExecutionId, HashMap<String, NodeState>>>,
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save_node_state(
        &self,
        execution_id: &str,
        node_id: &str,
        state: NodeState,
    ) -> Result<(), NodeError> {
        self.states
            .write()
            .entry(execution_id.to_string())
            .or_default()
            .insert(node_id.to_string(), state);
        Ok(())
    }

    async fn load_node_state(
        &self,
        execution_id: &str,
        node_id: &str,
    ) -> Result<NodeState, NodeError> {
        Ok(self
            .states
            .read()
            .get(execution_id)
            .and_then(|nodes| nodes.get(node_id))
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct MemoryFileStore {
    files: RwLock<HashMap<String, HashMap<String, StoredFile>>>,
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn put(
        &self,
        workflow_id: &str,
        filename: &str,
        contents: Vec<u8>,
        media_type: &str,
    ) -> Result<String, NodeError> {
        let id = format!("f_{}", Uuid::new_v4().simple());
        let meta = FileMeta {
            id: id.clone(),
            name: filename.to_string(),
            size: contents.len() as u64,
            media_type: media_type.to_string(),
            created_at: Utc::now(),
        };
        self.files
            .write()
            .entry(workflow_id.to_string())
            .or_default()
            .insert(id.clone(), StoredFile { meta, contents });
        Ok(id)
    }

    async fn get(&self, workflow_id: &str, file_id: &str) -> Result<StoredFile, NodeError> {
        self.files
            .read()
            .get(workflow_id)
            .and_then(|files| files.get(file_id))
            .cloned()
            .ok_or_else(|| NodeError::ExecutionFailed(format!("file not found: {}", file_id)))
    }

    async fn list(&self, workflow_id: &str) -> Result<Vec<FileMeta>, NodeError> {
        let mut metas: Vec<FileMeta> = self
            .files
            .read()
            .get(workflow_id)
            .map(|files| files.values().map(|f| f.meta.clone()).collect())
            .unwrap_or_default();
        metas.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(metas)
    }

    async fn delete(&self, workflow_id: &str, file_id: &str) -> Result<(), NodeError> {
        if let Some(files) = self.files.write().get_mut(workflow_id) {
            files.remove(file_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;

    #[tokio::test]
    async fn state_store_scopes_by_execution_and_node() {
        let store = MemoryStateStore::default();
        let mut state = NodeState::default();
        state.data.insert("seen".to_string(), Value::from(3i64));
        store.save_node_state("exec-1", "a", state.clone()).await.unwrap();

        assert_eq!(store.load_node_state("exec-1", "a").await.unwrap().data, state.data);
        assert!(store.load_node_state("exec-2", "a").await.unwrap().data.is_empty());
        assert!(store.load_node_state("exec-1", "b").await.unwrap().data.is_empty());
    }

    #[tokio::test]
    async fn file_store_put_get_list_delete() {
        let store = MemoryFileStore::default();
        let id = store
            .put("wf", "notes.txt", b"hello".to_vec(), "text/plain")
            .await
            .unwrap();

        let file = store.get("wf", &id).await.unwrap();
        assert_eq!(file.contents, b"hello");
        assert_eq!(file.meta.size, 5);
        assert_eq!(store.list("wf").await.unwrap().len(), 1);
        assert!(store.list("other").await.unwrap().is_empty());

        store.delete("wf", &id).await.unwrap();
        assert!(store.get("wf", &id).await.is_err());
    }
}
