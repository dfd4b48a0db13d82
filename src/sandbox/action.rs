//! Intents queued by sandbox-side helpers during a run.

use serde::{Deserialize, Serialize};

use crate::conversation::DataBlock;

/// A structured side-effect request drained after execution.
///
/// `target_file` is an id or a name; when absent the active file is used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxAction {
    AddLayer {
        #[serde(default)]
        target_file: Option<String>,
        #[serde(default)]
        name: Option<String>,
        /// `VECTOR`, `RASTER` or `HEATMAP` (case-insensitive).
        #[serde(default)]
        layer_type: Option<String>,
        /// Annotation list for vector layers, raster path otherwise.
        #[serde(default)]
        source: serde_json::Value,
        #[serde(default)]
        style: serde_json::Value,
    },
    #[serde(alias = "register_artifact")]
    AttachArtifact {
        #[serde(default)]
        target_file: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        source: Option<String>,
        #[serde(default)]
        artifact_type: Option<String>,
    },
    UpdateLayerData {
        #[serde(default)]
        target_file: Option<String>,
        layer_name: String,
        #[serde(default)]
        blocks: Vec<DataBlock>,
    },
    /// Also produced when a run's final value is an `analysis_result` object.
    #[serde(alias = "update_file_metadata")]
    AnalysisResult {
        #[serde(default)]
        target_file: Option<String>,
        #[serde(default)]
        metrics: serde_json::Map<String, serde_json::Value>,
    },
    LoadRoleFromFile {
        path: String,
    },
    Log {
        #[serde(default)]
        message: String,
        #[serde(default)]
        level: Option<String>,
    },
    SetStatus {
        #[serde(default)]
        status: String,
    },
    #[serde(other)]
    Unknown,
}
