//! Workspace files and the analysis data hung off them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a file lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCategory {
    /// Shared across threads.
    Project,
    /// Scratch output owned by a single thread.
    Session,
}

impl std::fmt::Display for FileCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Project => "project",
            Self::Session => "session",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Image,
    Dataset,
    Document,
    Other,
}

impl FileKind {
    pub fn from_mime(mime: &str) -> Self {
        match mime {
            m if m.starts_with("image/") => FileKind::Image,
            "text/csv" | "application/json" => FileKind::Dataset,
            m if m.starts_with("text/") || m == "application/pdf" => FileKind::Document,
            _ => FileKind::Other,
        }
    }
}

/// A file known to the workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub id: Uuid,
    pub name: String,
    pub kind: FileKind,
    pub mime_type: String,
    pub category: FileCategory,
    /// Owning thread for session files; `None` until associated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<Uuid>,
    /// Path inside the sandbox filesystem.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_path: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub layers: Vec<Layer>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl FileEntry {
    pub fn new(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        category: FileCategory,
    ) -> Self {
        let mime_type = mime_type.into();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind: FileKind::from_mime(&mime_type),
            mime_type,
            category,
            thread_id: None,
            virtual_path: None,
            created_at: Utc::now(),
            layers: Vec::new(),
            artifacts: Vec::new(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_thread(mut self, thread_id: Uuid) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    pub fn with_virtual_path(mut self, path: impl Into<String>) -> Self {
        self.virtual_path = Some(path.into());
        self
    }

    /// Session file not yet associated with any thread.
    pub fn is_orphan_session_file(&self) -> bool {
        self.category == FileCategory::Session && self.thread_id.is_none()
    }

    /// Path used when mounting into the sandbox.
    pub fn sandbox_path(&self) -> String {
        match &self.virtual_path {
            Some(path) => path.clone(),
            None => match self.category {
                FileCategory::Project => format!("/workspace/data/{}", self.name),
                FileCategory::Session => format!("/.session/{}", self.name),
            },
        }
    }

    /// Visible to the given thread: project files plus its own session files.
    pub fn visible_in(&self, thread_id: Uuid) -> bool {
        match self.category {
            FileCategory::Project => true,
            FileCategory::Session => self.thread_id.is_none_or(|t| t == thread_id),
        }
    }

    pub fn layer_by_name_mut(&mut self, name: &str) -> Option<&mut Layer> {
        self.layers.iter_mut().find(|l| l.name == name)
    }
}

/// Binary output produced by a tool or a sandbox run, not yet registered.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedFile {
    pub name: String,
    pub mime_type: String,
    pub category: FileCategory,
    pub virtual_path: String,
    pub bytes: Vec<u8>,
}

impl GeneratedFile {
    /// Materialize as a workspace entry with a fresh id.
    pub fn to_entry(&self, thread_id: Uuid) -> FileEntry {
        let mut entry = FileEntry::new(&self.name, &self.mime_type, self.category)
            .with_virtual_path(&self.virtual_path);
        if self.category == FileCategory::Session {
            entry.thread_id = Some(thread_id);
        }
        entry
            .metadata
            .insert("status".into(), serde_json::Value::from("Generated"));
        entry
    }
}

// ── Analysis layers ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Vector,
    Raster,
    Heatmap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerStyle {
    pub visible: bool,
    pub opacity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_map: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke_color: Option<String>,
}

impl Default for LayerStyle {
    fn default() -> Self {
        Self {
            visible: true,
            opacity: 0.7,
            color_map: None,
            fill_color: None,
            stroke_color: None,
        }
    }
}

/// A visualization layer over a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub id: Uuid,
    pub name: String,
    pub kind: LayerKind,
    /// Vector shapes (vector layers only).
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    /// Raster source path (raster and heatmap layers).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub data: Vec<DataBlock>,
    pub style: LayerStyle,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationKind {
    Point,
    Box,
    Polygon,
    Arrow,
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: String,
    pub kind: AnnotationKind,
    /// Coordinates: `[x, y]`, `[x, y, w, h]` or a list of points.
    pub geometry: serde_json::Value,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// A reported metric block shown alongside a layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataBlock {
    Kv {
        #[serde(default)]
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        data: serde_json::Map<String, serde_json::Value>,
    },
    Text {
        #[serde(default)]
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        content: String,
    },
    Distribution {
        #[serde(default)]
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        labels: Vec<String>,
        values: Vec<f64>,
    },
    Image {
        #[serde(default)]
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        url: String,
    },
}

impl DataBlock {
    pub fn id(&self) -> &str {
        match self {
            DataBlock::Kv { id, .. }
            | DataBlock::Text { id, .. }
            | DataBlock::Distribution { id, .. }
            | DataBlock::Image { id, .. } => id,
        }
    }

    /// Assign a fresh id if the block has none.
    pub fn ensure_id(&mut self) {
        let slot = match self {
            DataBlock::Kv { id, .. }
            | DataBlock::Text { id, .. }
            | DataBlock::Distribution { id, .. }
            | DataBlock::Image { id, .. } => id,
        };
        if slot.is_empty() {
            *slot = Uuid::new_v4().to_string();
        }
    }
}

/// A related output (plot, table) attached to a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub name: String,
    /// `PLOT`, `IMAGE`, `DATA` or a persona-declared type.
    pub kind: String,
    /// Sandbox path of the artifact.
    pub source: String,
    pub created_at: DateTime<Utc>,
}
