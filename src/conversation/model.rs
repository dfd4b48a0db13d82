//! Thread, Turn, Content and Part types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Title used when the first message has no usable text.
pub const DEFAULT_THREAD_TITLE: &str = "New Chat";

// ── Thread ──────────────────────────────────────────────────────────

/// Per-thread model and persona selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadConfig {
    /// Model used for the conversation.
    pub model: String,
    /// Model used by image-generation capabilities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_model: Option<String>,
    /// Active persona.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona_id: Option<String>,
}

impl ThreadConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            image_model: None,
            persona_id: None,
        }
    }

    pub fn with_image_model(mut self, model: impl Into<String>) -> Self {
        self.image_model = Some(model.into());
        self
    }

    pub fn with_persona(mut self, persona_id: impl Into<String>) -> Self {
        self.persona_id = Some(persona_id.into());
        self
    }
}

/// A conversation session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: Uuid,
    pub title: String,
    pub updated_at: DateTime<Utc>,
    /// Short excerpt of the most recent user message.
    pub preview: String,
    pub config: ThreadConfig,
}

impl Thread {
    /// Create a thread titled after its first message.
    pub fn new(first_message: &str, title_max_chars: usize, config: ThreadConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: derive_title(first_message, title_max_chars),
            updated_at: Utc::now(),
            preview: first_message.to_string(),
            config,
        }
    }

    /// Record activity on the thread.
    pub fn touch(&mut self, preview: &str) {
        self.preview = preview.to_string();
        self.updated_at = Utc::now();
    }
}

/// First `max_chars` characters of the message, or the default title.
pub fn derive_title(message: &str, max_chars: usize) -> String {
    let title: String = message.trim().chars().take(max_chars).collect();
    if title.is_empty() {
        DEFAULT_THREAD_TITLE.to_string()
    } else {
        title
    }
}

// ── Parts ───────────────────────────────────────────────────────────

/// A capability invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Call id, echoed back by the matching response.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// The outcome of a capability invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    /// `{"result": ...}` or `{"error": ...}`.
    pub response: serde_json::Value,
}

impl FunctionResponse {
    pub fn result(
        id: impl Into<String>,
        name: impl Into<String>,
        result: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            response: serde_json::json!({ "result": result.into() }),
        }
    }

    pub fn error(
        id: impl Into<String>,
        name: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            response: serde_json::json!({ "error": error.into() }),
        }
    }

    /// Human-readable rendering of the payload.
    ///
    /// Prefers a non-empty `result`, then `error`, then the raw JSON.
    pub fn display_text(&self) -> String {
        if let Some(result) = self.response.get("result").filter(|v| is_truthy(v)) {
            return match result {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
        }
        if let Some(error) = self.response.get("error").filter(|v| is_truthy(v)) {
            return match error {
                serde_json::Value::String(s) => format!("Error: {s}"),
                other => format!("Error: {other}"),
            };
        }
        serde_json::to_string_pretty(&self.response).unwrap_or_default()
    }
}

fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => true,
    }
}

/// A web source cited by the model.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GroundingChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Citation metadata attached to a response.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GroundingMetadata {
    #[serde(default)]
    pub chunks: Vec<GroundingChunk>,
    /// Segment-to-chunk mappings, kept opaque.
    #[serde(default)]
    pub supports: Vec<serde_json::Value>,
    #[serde(default)]
    pub queries: Vec<String>,
}

impl GroundingMetadata {
    /// True when there is nothing to cite.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty() && self.supports.is_empty()
    }
}

/// The atomic unit of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Part {
    Text(String),
    Thought {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    /// Reference to a workspace file by id.
    FileRef(Uuid),
    FunctionCall(FunctionCall),
    FunctionResponse(FunctionResponse),
    Grounding(GroundingMetadata),
    Error(String),
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text(text.into())
    }

    pub fn thought(text: impl Into<String>) -> Self {
        Part::Thought {
            text: text.into(),
            signature: None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_function_call(&self) -> Option<&FunctionCall> {
        match self {
            Part::FunctionCall(call) => Some(call),
            _ => None,
        }
    }

    pub fn as_function_response(&self) -> Option<&FunctionResponse> {
        match self {
            Part::FunctionResponse(resp) => Some(resp),
            _ => None,
        }
    }
}

// ── Content ─────────────────────────────────────────────────────────

/// Who produced a piece of content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Model,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::User => "user",
            Self::Model => "model",
            Self::Tool => "tool",
        };
        write!(f, "{s}")
    }
}

/// A role-tagged bundle of parts inside a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub id: Uuid,
    pub role: Role,
    pub parts: Vec<Part>,
    pub timestamp: DateTime<Utc>,
    /// Owning turn.
    pub turn_id: Uuid,
}

impl Content {
    pub fn new(turn_id: Uuid, role: Role, parts: Vec<Part>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            parts,
            timestamp: Utc::now(),
            turn_id,
        }
    }

    /// Concatenation of all text parts.
    pub fn text(&self) -> String {
        self.parts.iter().filter_map(Part::as_text).collect()
    }

    pub fn function_calls(&self) -> impl Iterator<Item = &FunctionCall> {
        self.parts.iter().filter_map(Part::as_function_call)
    }

    /// Whether this content answers the given call id.
    pub fn responds_to(&self, call_id: &str) -> bool {
        self.parts
            .iter()
            .filter_map(Part::as_function_response)
            .any(|r| r.id == call_id)
    }
}

// ── Turn ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    User,
    Assistant,
}

/// Lifecycle of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Streaming,
    Complete,
    Error,
}

impl TurnStatus {
    /// Status only moves forward: streaming to complete or error.
    pub fn can_transition_to(&self, target: TurnStatus) -> bool {
        use TurnStatus::*;

        matches!((self, target), (Streaming, Complete) | (Streaming, Error))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

impl fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Streaming => "streaming",
            Self::Complete => "complete",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// One logical exchange within a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub kind: TurnKind,
    pub status: TurnStatus,
    pub contents: Vec<Content>,
}

impl Turn {
    /// A completed user turn holding the message text and attachments.
    pub fn user(thread_id: Uuid, text: &str, attachments: &[Uuid]) -> Self {
        let id = Uuid::new_v4();
        let mut parts = vec![Part::text(text)];
        parts.extend(attachments.iter().copied().map(Part::FileRef));
        Self {
            id,
            thread_id,
            kind: TurnKind::User,
            status: TurnStatus::Complete,
            contents: vec![Content::new(id, Role::User, parts)],
        }
    }

    /// An empty assistant turn in the streaming state.
    pub fn assistant(thread_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            thread_id,
            kind: TurnKind::Assistant,
            status: TurnStatus::Streaming,
            contents: Vec::new(),
        }
    }

    /// Append a new content owned by this turn and return its id.
    pub fn push_content(&mut self, role: Role, parts: Vec<Part>) -> Uuid {
        let content = Content::new(self.id, role, parts);
        let id = content.id;
        self.contents.push(content);
        id
    }

    pub fn content_mut(&mut self, id: Uuid) -> Option<&mut Content> {
        self.contents.iter_mut().find(|c| c.id == id)
    }

    /// All parts in order, tagged with their content's role.
    pub fn parts(&self) -> impl Iterator<Item = (Role, &Part)> {
        self.contents
            .iter()
            .flat_map(|c| c.parts.iter().map(move |p| (c.role, p)))
    }

    pub fn is_streaming(&self) -> bool {
        self.status == TurnStatus::Streaming
    }
}
