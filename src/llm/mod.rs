//! Model-streaming contract.
//!
//! The network client lives behind [`ModelStreamer`]. Each stream item is the
//! full cumulative part list so far, never a delta.

pub mod history;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::conversation::{Content, FileEntry, FunctionResponse, Part};
use crate::error::ModelError;
use crate::persona::Persona;

pub use history::{model_history, turn_history};

/// Thinking budget used when a persona does not declare one.
pub const DEFAULT_THINKING_BUDGET: u32 = 8192;

/// Declaration of a tool the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// The new message of a model round.
#[derive(Debug, Clone, PartialEq)]
pub enum OutgoingMessage {
    /// User text, or embedded-code feedback.
    Text(String),
    /// Answer to the previous round's function call.
    ToolResponse(FunctionResponse),
}

/// Progress of a file upload to the model provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Uploading,
    Active,
    Failed,
}

/// Callback invoked as context files are uploaded.
pub type UploadStatusFn = Arc<dyn Fn(Uuid, UploadState) + Send + Sync>;

/// Cumulative snapshots of the model's response.
pub type PartStream = Pin<Box<dyn Stream<Item = Result<Vec<Part>, ModelError>> + Send>>;

/// Everything needed for one model round.
#[derive(Clone)]
pub struct StreamRequest {
    /// Sanitized history, see [`model_history`].
    pub history: Vec<Content>,
    pub message: OutgoingMessage,
    /// All workspace files visible to the thread.
    pub files: Vec<FileEntry>,
    /// Files to inline alongside a text message.
    pub context_files: Vec<FileEntry>,
    pub persona: Persona,
    pub tools: Vec<ToolDefinition>,
    pub model: String,
    pub cancel: CancellationToken,
    pub on_upload_status: Option<UploadStatusFn>,
}

impl StreamRequest {
    /// System instruction for this round.
    pub fn system_instruction(&self) -> String {
        format!(
            "{}\n\nIMPORTANT: If you use the thinking process, you MUST provide a final textual response to the user after your thoughts.",
            self.persona.system_prompt
        )
    }

    pub fn thinking_budget(&self) -> u32 {
        thinking_budget(&self.model, self.persona.manifest.thinking_budget)
    }
}

/// Persona budget capped by what the model accepts.
pub fn thinking_budget(model: &str, requested: Option<u32>) -> u32 {
    let cap = if model.contains("pro") { 32768 } else { 24576 };
    requested.unwrap_or(DEFAULT_THINKING_BUDGET).min(cap)
}

/// A streaming language model.
#[async_trait]
pub trait ModelStreamer: Send + Sync {
    /// Start a round. Implementations should stop yielding once `cancel` fires.
    async fn stream(&self, request: StreamRequest) -> Result<PartStream, ModelError>;
}
