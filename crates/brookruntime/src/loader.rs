//! Workflow files: a workflow definition plus optional initial data.

use brookcore::{FlowError, Inputs, Workflow};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// On-disk shape of a workflow file.
///
/// ```json
/// { "workflow": { "id": "...", "name": "...", "nodes": [], "edges": [] },
///   "data": { "start": [ { "message": "hi" } ] } }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowFile {
    pub workflow: Workflow,
    #[serde(default, skip_serializing_if = "Inputs::is_empty")]
    pub data: Inputs,
}

impl WorkflowFile {
    pub fn new(workflow: Workflow, data: Inputs) -> Self {
        Self { workflow, data }
    }

    pub fn from_json(json: &str) -> Result<Self, FlowError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json_pretty(&self) -> Result<String, FlowError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await?;
        let file = Self::from_json(&raw)?;
        tracing::debug!(
            path = %path.display(),
            workflow_id = %file.workflow.id,
            nodes = file.workflow.nodes.len(),
            "Loaded workflow file"
        );
        Ok(file)
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), FlowError> {
        tokio::fs::write(path, self.to_json_pretty()?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_section_is_optional() {
        let file = WorkflowFile::from_json(
            r#"{"workflow":{"id":"wf","name":"demo","nodes":[{"id":"a","type":"echo"}],"edges":[]}}"#,
        )
        .unwrap();
        assert_eq!(file.workflow.nodes[0].node_type, "echo");
        assert!(file.data.is_empty());
    }

    #[test]
    fn malformed_file_is_a_serialization_error() {
        let err = WorkflowFile::from_json("{\"workflow\": 3}").unwrap_err();
        assert!(matches!(err, FlowError::Serialization(_)));
    }
}
