//! Tool trait and the types flowing through a tool call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::conversation::{FileEntry, GeneratedFile};
use crate::sandbox::WorkspaceMutation;
use crate::store::Store;

/// Error type for tool execution.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Tool not found: {0}")]
    NotFound(String),
}

/// Output from a tool execution.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// Human/model readable result text.
    pub result: String,
    /// Set when the tool ran but failed; the text is forwarded as an error payload.
    pub error: Option<String>,
    /// Binary outputs not yet registered as workspace files.
    pub generated_files: Vec<GeneratedFile>,
    /// Host-side changes requested by the tool.
    pub mutations: Vec<WorkspaceMutation>,
    /// Extra machine-readable data, published as an event and never sent to the model.
    pub structured_data: Option<serde_json::Value>,
}

impl ToolOutput {
    /// Create a plain text output.
    pub fn text(result: impl Into<String>) -> Self {
        Self {
            result: result.into(),
            ..Default::default()
        }
    }

    /// Create a failed output carrying both result text and the error.
    pub fn failure(result: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            result: result.into(),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_files(mut self, files: Vec<GeneratedFile>) -> Self {
        self.generated_files = files;
        self
    }

    pub fn with_mutations(mut self, mutations: Vec<WorkspaceMutation>) -> Self {
        self.mutations = mutations;
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.structured_data = Some(data);
        self
    }
}

/// Workspace state handed to a tool.
#[derive(Clone)]
pub struct ToolContext {
    pub thread_id: Uuid,
    /// Every file visible to the thread.
    pub files: Vec<FileEntry>,
    pub active_file_id: Option<Uuid>,
    /// Image model configured on the thread, if any.
    pub image_model: Option<String>,
    /// Source of file bytes for tools that need them.
    pub store: Option<Arc<dyn Store>>,
}

impl ToolContext {
    pub fn new(thread_id: Uuid, files: Vec<FileEntry>) -> Self {
        Self {
            thread_id,
            files,
            active_file_id: None,
            image_model: None,
            store: None,
        }
    }

    pub fn with_active_file(mut self, id: Option<Uuid>) -> Self {
        self.active_file_id = id;
        self
    }

    pub fn with_image_model(mut self, model: Option<String>) -> Self {
        self.image_model = model;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("thread_id", &self.thread_id)
            .field("files", &self.files.len())
            .field("active_file_id", &self.active_file_id)
            .field("image_model", &self.image_model)
            .finish_non_exhaustive()
    }
}

/// A capability the model may invoke by name.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool name.
    fn name(&self) -> &str;

    /// Get a description of what the tool does.
    fn description(&self) -> &str;

    /// Get the JSON Schema for the tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Whether the declaration is sent to the model.
    ///
    /// Tools reached another way (fenced code) stay callable but undeclared.
    fn exposed_to_model(&self) -> bool {
        true
    }

    /// Execute the tool with the given parameters.
    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError>;
}

/// Extract a required string parameter.
pub fn require_str<'a>(params: &'a serde_json::Value, name: &str) -> Result<&'a str, ToolError> {
    params
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidParameters(format!("missing '{}' parameter", name)))
}
