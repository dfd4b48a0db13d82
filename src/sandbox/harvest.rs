//! Turn a finished sandbox run into generated files and workspace mutations.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::conversation::{
    Annotation, AnnotationKind, Artifact, DataBlock, FileCategory, FileEntry, GeneratedFile,
    Layer, LayerKind, LayerStyle,
};
use crate::parser::GENERATED_FILES_PREFIX;
use crate::persona::{Persona, PersonaRegistry};
use crate::sandbox::{PROJECT_ROOT, RunOutput, Sandbox, SandboxAction, Snapshot};
use crate::tools::ToolContext;

const DEFAULT_LAYER_NAME: &str = "New Layer";
const DEFAULT_ANNOTATION_COLOR: &str = "#000000";
const DEFAULT_LAYER_OPACITY: f64 = 0.7;
const DEFAULT_ARTIFACT_KIND: &str = "PLOT";

/// A host-side change requested by a sandbox run.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkspaceMutation {
    AddLayer {
        file_id: Uuid,
        layer: Layer,
    },
    AttachArtifact {
        file_id: Uuid,
        artifact: Artifact,
    },
    UpdateLayerData {
        file_id: Uuid,
        layer_id: Uuid,
        blocks: Vec<DataBlock>,
    },
    UpdateFileMetadata {
        file_id: Uuid,
        metadata: serde_json::Map<String, Value>,
    },
    PersonaRegistered {
        persona_id: String,
        name: String,
    },
}

/// Everything a run produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HarvestReport {
    /// Text fed back to the model.
    pub output: String,
    pub error: Option<String>,
    pub generated_files: Vec<GeneratedFile>,
    pub mutations: Vec<WorkspaceMutation>,
}

/// Paths that are new or whose modification time changed, in path order.
pub fn diff_snapshots(before: &Snapshot, after: &Snapshot) -> Vec<String> {
    after
        .iter()
        .filter(|(path, mtime)| before.get(*path) != Some(*mtime))
        .map(|(path, _)| path.clone())
        .collect()
}

/// Storage category implied by a sandbox path.
pub fn classify_path(path: &str) -> FileCategory {
    if path.starts_with(PROJECT_ROOT) {
        FileCategory::Project
    } else {
        FileCategory::Session
    }
}

/// Best-effort MIME type from a file extension.
pub fn mime_for_path(path: &str) -> &'static str {
    let ext = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "tif" | "tiff" => "image/tiff",
        "csv" => "text/csv",
        "json" => "application/json",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Converts drained actions and changed files into a [`HarvestReport`].
#[derive(Default)]
pub struct Harvester {
    personas: Option<Arc<PersonaRegistry>>,
}

impl Harvester {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable `load_role_from_file` actions.
    pub fn with_personas(mut self, personas: Arc<PersonaRegistry>) -> Self {
        self.personas = Some(personas);
        self
    }

    /// Harvest a completed run.
    ///
    /// A failed run yields only the error text; its queued actions are dropped.
    pub async fn harvest(
        &self,
        sandbox: &dyn Sandbox,
        run: RunOutput,
        changed_paths: Vec<String>,
        actions: Vec<SandboxAction>,
        ctx: &ToolContext,
    ) -> HarvestReport {
        if let Some(error) = run.error {
            if !actions.is_empty() {
                debug!(count = actions.len(), "Discarding actions from failed run");
            }
            return HarvestReport {
                output: format!("Error: {error}\nStdout: {}", run.stdout),
                error: Some(error),
                ..Default::default()
            };
        }

        let generated = collect_generated(sandbox, &changed_paths).await;

        let mut pass = ActionPass::new(ctx);
        let mut actions = actions;
        if let Some(intent) = result_intent(run.result.as_ref()) {
            actions.push(intent);
        }
        for action in actions {
            self.apply(action, &mut pass, sandbox).await;
        }

        let output = format_output(&run, &pass, &generated);
        HarvestReport {
            output,
            error: None,
            generated_files: generated,
            mutations: pass.mutations,
        }
    }

    async fn apply(&self, action: SandboxAction, pass: &mut ActionPass, sandbox: &dyn Sandbox) {
        match action {
            SandboxAction::AddLayer {
                target_file,
                name,
                layer_type,
                source,
                style,
            } => {
                let Some(file) = pass.target_mut(target_file.as_deref()) else {
                    return;
                };
                let layer = build_layer(
                    name.as_deref(),
                    layer_type.as_deref(),
                    &source,
                    &style,
                    &file.layers,
                );
                file.layers.push(layer.clone());
                let file_id = file.id;
                pass.layers_created += 1;
                pass.mutations
                    .push(WorkspaceMutation::AddLayer { file_id, layer });
            }
            SandboxAction::AttachArtifact {
                target_file,
                name,
                path,
                source,
                artifact_type,
            } => {
                let Some(file) = pass.target_mut(target_file.as_deref()) else {
                    return;
                };
                let artifact = Artifact {
                    id: Uuid::new_v4(),
                    name: name
                        .or_else(|| path.as_deref().map(|p| base_name(p).to_string()))
                        .unwrap_or_else(|| "Artifact".to_string()),
                    kind: artifact_type.unwrap_or_else(|| DEFAULT_ARTIFACT_KIND.to_string()),
                    source: source.or(path).unwrap_or_default(),
                    created_at: Utc::now(),
                };
                file.artifacts.push(artifact.clone());
                let file_id = file.id;
                pass.artifacts_attached += 1;
                pass.mutations
                    .push(WorkspaceMutation::AttachArtifact { file_id, artifact });
            }
            SandboxAction::UpdateLayerData {
                target_file,
                layer_name,
                mut blocks,
            } => {
                let Some(file) = pass.target_mut(target_file.as_deref()) else {
                    return;
                };
                let file_id = file.id;
                let Some(layer) = file.layer_by_name_mut(&layer_name) else {
                    warn!(layer = %layer_name, "update_layer_data: no such layer, skipping");
                    return;
                };
                blocks.iter_mut().for_each(DataBlock::ensure_id);
                layer.data = blocks.clone();
                let layer_id = layer.id;
                pass.layers_updated += 1;
                pass.mutations.push(WorkspaceMutation::UpdateLayerData {
                    file_id,
                    layer_id,
                    blocks,
                });
            }
            SandboxAction::AnalysisResult {
                target_file,
                metrics,
            } => {
                if metrics.is_empty() {
                    return;
                }
                let Some(file) = pass.target_mut(target_file.as_deref()) else {
                    return;
                };
                file.metadata.extend(metrics.clone());
                let file_id = file.id;
                pass.mutations.push(WorkspaceMutation::UpdateFileMetadata {
                    file_id,
                    metadata: metrics,
                });
            }
            SandboxAction::LoadRoleFromFile { path } => {
                match self.load_persona(sandbox, &path).await {
                    Ok(persona) => {
                        pass.notes.push_str(&format!(
                            "\n[System] Successfully registered new role: {} ({}).",
                            persona.manifest.name, persona.manifest.id
                        ));
                        pass.mutations.push(WorkspaceMutation::PersonaRegistered {
                            persona_id: persona.manifest.id.clone(),
                            name: persona.manifest.name.clone(),
                        });
                    }
                    Err(e) => {
                        warn!(path = %path, "Failed to load generated role: {}", e);
                        pass.notes
                            .push_str(&format!("\n[System] Error loading generated role: {e}"));
                    }
                }
            }
            SandboxAction::Log { message, level } => match level.as_deref() {
                Some("warn" | "warning" | "error") => warn!(source = "sandbox", "{}", message),
                _ => info!(source = "sandbox", "{}", message),
            },
            SandboxAction::SetStatus { status } => {
                debug!(status = %status, "Sandbox status");
            }
            SandboxAction::Unknown => {
                debug!("Ignoring unknown sandbox action");
            }
        }
    }

    async fn load_persona(&self, sandbox: &dyn Sandbox, path: &str) -> Result<Persona, String> {
        let registry = self
            .personas
            .as_ref()
            .ok_or_else(|| "persona registry unavailable".to_string())?;
        let bytes = sandbox.read_file(path).await.map_err(|e| e.to_string())?;
        let persona = Persona::from_package(&bytes).map_err(|e| e.to_string())?;
        registry
            .register(persona.clone())
            .await
            .map_err(|e| e.to_string())?;
        Ok(persona)
    }
}

/// Working state for a single drain.
struct ActionPass {
    /// Copy of the workspace so later actions see earlier ones.
    files: Vec<FileEntry>,
    active_file_id: Option<Uuid>,
    mutations: Vec<WorkspaceMutation>,
    notes: String,
    layers_created: usize,
    artifacts_attached: usize,
    layers_updated: usize,
}

impl ActionPass {
    fn new(ctx: &ToolContext) -> Self {
        Self {
            files: ctx.files.clone(),
            active_file_id: ctx.active_file_id,
            mutations: Vec::new(),
            notes: String::new(),
            layers_created: 0,
            artifacts_attached: 0,
            layers_updated: 0,
        }
    }

    /// Resolve an explicit id/name reference, or fall back to the active file.
    fn target_mut(&mut self, target: Option<&str>) -> Option<&mut FileEntry> {
        let id = match target {
            Some(reference) => {
                let found = self
                    .files
                    .iter()
                    .find(|f| f.id.to_string() == reference || f.name == reference)
                    .map(|f| f.id);
                if found.is_none() {
                    warn!(target_file = %reference, "Unresolvable action target, skipping");
                }
                found?
            }
            None => self.active_file_id?,
        };
        self.files.iter_mut().find(|f| f.id == id)
    }
}

async fn collect_generated(sandbox: &dyn Sandbox, paths: &[String]) -> Vec<GeneratedFile> {
    let mut generated = Vec::with_capacity(paths.len());
    for path in paths {
        match sandbox.read_file(path).await {
            Ok(bytes) => generated.push(GeneratedFile {
                name: base_name(path).to_string(),
                mime_type: mime_for_path(path).to_string(),
                category: classify_path(path),
                virtual_path: path.clone(),
                bytes,
            }),
            Err(e) => warn!(path = %path, "Failed to read generated file: {}", e),
        }
    }
    generated
}

/// A final value shaped like `{"type": "analysis_result", ...}` doubles as an action.
fn result_intent(result: Option<&Value>) -> Option<SandboxAction> {
    let value = result?;
    if value.get("type").and_then(Value::as_str) != Some("analysis_result") {
        return None;
    }
    serde_json::from_value(value.clone()).ok()
}

fn render_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Array(_) | Value::Object(_) => serde_json::to_string_pretty(value).ok(),
        other => Some(other.to_string()),
    }
}

fn format_output(run: &RunOutput, pass: &ActionPass, generated: &[GeneratedFile]) -> String {
    let mut result_text = pass.notes.clone();
    if let Some(rendered) = run.result.as_ref().and_then(render_value) {
        if !result_text.is_empty() {
            result_text.push('\n');
        }
        result_text.push_str(&rendered);
    }

    let mut out = String::new();
    if !run.stdout.is_empty() {
        out.push_str(&run.stdout);
        out.push('\n');
    }
    out.push_str(&result_text);

    if !generated.is_empty() {
        let listing: Vec<String> = generated
            .iter()
            .map(|f| format!("{} ({})", f.name, f.category))
            .collect();
        out.push_str(&format!("\n{GENERATED_FILES_PREFIX}{}", listing.join(", ")));
    }
    if pass.layers_created > 0 {
        out.push_str(&format!(
            "\n[System] Created {} new layer(s).",
            pass.layers_created
        ));
    }
    if pass.artifacts_attached > 0 {
        out.push_str(&format!(
            "\n[System] Attached {} related artifact(s).",
            pass.artifacts_attached
        ));
    }
    if pass.layers_updated > 0 {
        out.push_str(&format!(
            "\n[System] Updated stats/data for {} layer(s).",
            pass.layers_updated
        ));
    }

    out.trim().to_string()
}

fn build_layer(
    name: Option<&str>,
    layer_type: Option<&str>,
    source: &Value,
    style: &Value,
    existing: &[Layer],
) -> Layer {
    let base = name.filter(|n| !n.is_empty()).unwrap_or(DEFAULT_LAYER_NAME);
    let mut unique = base.to_string();
    let mut counter = 1;
    while existing.iter().any(|l| l.name == unique) {
        unique = format!("{base} ({counter})");
        counter += 1;
    }

    let kind = match layer_type.map(str::to_ascii_lowercase).as_deref() {
        Some("vector") => LayerKind::Vector,
        Some("raster") => LayerKind::Raster,
        Some("heatmap") => LayerKind::Heatmap,
        _ if source.is_array() => LayerKind::Vector,
        _ => LayerKind::Raster,
    };

    let annotations = match (kind, source.as_array()) {
        (LayerKind::Vector, Some(items)) => items.iter().filter_map(normalize_annotation).collect(),
        _ => Vec::new(),
    };

    let color = style.get("color").and_then(Value::as_str).map(String::from);
    Layer {
        id: Uuid::new_v4(),
        name: unique,
        kind,
        annotations,
        source: source.as_str().map(String::from),
        data: Vec::new(),
        style: LayerStyle {
            visible: true,
            opacity: style
                .get("opacity")
                .and_then(Value::as_f64)
                .unwrap_or(DEFAULT_LAYER_OPACITY),
            color_map: style
                .get("colorMap")
                .or_else(|| style.get("color_map"))
                .and_then(Value::as_str)
                .map(String::from),
            fill_color: color.clone(),
            stroke_color: color,
        },
        created_at: Utc::now(),
    }
}

fn normalize_annotation(value: &Value) -> Option<Annotation> {
    let obj = value.as_object()?;
    let kind = match obj.get("type").and_then(Value::as_str)? {
        "point" => AnnotationKind::Point,
        "box" => AnnotationKind::Box,
        "polygon" => AnnotationKind::Polygon,
        "arrow" | "line" => AnnotationKind::Arrow,
        "text" => AnnotationKind::Text,
        other => {
            debug!(kind = %other, "Dropping annotation of unknown type");
            return None;
        }
    };
    let geometry = ["geometry", "points", "position"]
        .iter()
        .find_map(|key| obj.get(*key).filter(|v| !v.is_null()))
        .cloned()
        .unwrap_or_else(|| Value::Array(Vec::new()));

    Some(Annotation {
        id: obj
            .get("id")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        kind,
        geometry,
        color: obj
            .get("color")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_ANNOTATION_COLOR)
            .to_string(),
        label: obj.get("label").and_then(Value::as_str).map(String::from),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::{Duration, SystemTime};

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Mutex;

    use super::*;
    use crate::error::SandboxError;
    use crate::sandbox::SandboxContext;

    #[derive(Default)]
    struct MemSandbox {
        files: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl MemSandbox {
        async fn with_file(self, path: &str, bytes: &[u8]) -> Self {
            self.files.lock().await.insert(path.to_string(), bytes.to_vec());
            self
        }
    }

    #[async_trait]
    impl Sandbox for MemSandbox {
        async fn run_code(&self, _source: &str) -> Result<RunOutput, SandboxError> {
            Ok(RunOutput::default())
        }
        async fn snapshot(&self) -> Result<Snapshot, SandboxError> {
            Ok(Snapshot::new())
        }
        async fn drain_actions(&self) -> Result<Vec<SandboxAction>, SandboxError> {
            Ok(Vec::new())
        }
        async fn read_file(&self, path: &str) -> Result<Vec<u8>, SandboxError> {
            self.files
                .lock()
                .await
                .get(path)
                .cloned()
                .ok_or_else(|| SandboxError::PathNotFound(path.to_string()))
        }
        async fn write_file(&self, path: &str, bytes: &[u8]) -> Result<(), SandboxError> {
            self.files.lock().await.insert(path.to_string(), bytes.to_vec());
            Ok(())
        }
        async fn sync_context(&self, _context: &SandboxContext) -> Result<(), SandboxError> {
            Ok(())
        }
        async fn install_package(&self, _package: &str) -> Result<(), SandboxError> {
            Ok(())
        }
        async fn import_module(&self, _module: &str) -> Result<(), SandboxError> {
            Ok(())
        }
    }

    fn image_file(name: &str) -> FileEntry {
        FileEntry::new(name, "image/tiff", FileCategory::Project)
    }

    fn ctx_with(files: Vec<FileEntry>, active: Option<Uuid>) -> ToolContext {
        let mut ctx = ToolContext::new(Uuid::new_v4(), files);
        ctx.active_file_id = active;
        ctx
    }

    fn ok_run(stdout: &str) -> RunOutput {
        RunOutput {
            stdout: stdout.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn snapshot_diff_reports_new_and_modified() {
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(10);
        let t1 = t0 + Duration::from_secs(1);
        let before = Snapshot::from([
            ("/.session/a.png".to_string(), t0),
            ("/.session/b.png".to_string(), t0),
        ]);
        let after = Snapshot::from([
            ("/.session/a.png".to_string(), t0),
            ("/.session/b.png".to_string(), t1),
            ("/workspace/data/c.csv".to_string(), t1),
        ]);
        assert_eq!(
            diff_snapshots(&before, &after),
            vec!["/.session/b.png", "/workspace/data/c.csv"]
        );
    }

    #[test]
    fn mime_and_category_inference() {
        assert_eq!(mime_for_path("/.session/plot.PNG"), "image/png");
        assert_eq!(mime_for_path("/x/y.jpeg"), "image/jpeg");
        assert_eq!(mime_for_path("/x/stack.tif"), "image/tiff");
        assert_eq!(mime_for_path("/x/table.csv"), "text/csv");
        assert_eq!(mime_for_path("/x/blob"), "application/octet-stream");
        assert_eq!(classify_path("/workspace/data/out.csv"), FileCategory::Project);
        assert_eq!(classify_path("/.session/out.png"), FileCategory::Session);
    }

    #[tokio::test]
    async fn failed_run_reports_error_and_drops_actions() {
        let sandbox = MemSandbox::default();
        let file = image_file("cells.tif");
        let ctx = ctx_with(vec![file.clone()], Some(file.id));
        let run = RunOutput {
            stdout: "partial".into(),
            result: None,
            error: Some("NameError: x".into()),
        };
        let actions = vec![SandboxAction::AddLayer {
            target_file: None,
            name: Some("Nuclei".into()),
            layer_type: Some("VECTOR".into()),
            source: json!([]),
            style: Value::Null,
        }];

        let report = Harvester::new()
            .harvest(&sandbox, run, vec![], actions, &ctx)
            .await;
        assert_eq!(report.output, "Error: NameError: x\nStdout: partial");
        assert_eq!(report.error.as_deref(), Some("NameError: x"));
        assert!(report.mutations.is_empty());
    }

    #[tokio::test]
    async fn add_layer_normalizes_and_dedupes() {
        let sandbox = MemSandbox::default();
        let mut file = image_file("cells.tif");
        file.layers.push(build_layer(
            Some("Nuclei"),
            Some("VECTOR"),
            &json!([]),
            &Value::Null,
            &[],
        ));
        let ctx = ctx_with(vec![file.clone()], Some(file.id));
        let actions = vec![SandboxAction::AddLayer {
            target_file: None,
            name: Some("Nuclei".into()),
            layer_type: Some("VECTOR".into()),
            source: json!([
                {"type": "point", "position": [4, 5]},
                {"type": "line", "points": [[0, 0], [1, 1]], "color": "#ff0000", "id": "a1"},
                {"type": "blob"}
            ]),
            style: json!({"color": "#00ff00", "opacity": 0.5}),
        }];

        let report = Harvester::new()
            .harvest(&sandbox, ok_run(""), vec![], actions, &ctx)
            .await;
        assert_eq!(report.output, "[System] Created 1 new layer(s).");
        let WorkspaceMutation::AddLayer { file_id, layer } = &report.mutations[0] else {
            panic!("expected add layer mutation");
        };
        assert_eq!(*file_id, file.id);
        assert_eq!(layer.name, "Nuclei (1)");
        assert_eq!(layer.kind, LayerKind::Vector);
        assert_eq!(layer.annotations.len(), 2);
        assert_eq!(layer.annotations[0].color, DEFAULT_ANNOTATION_COLOR);
        assert_eq!(layer.annotations[0].geometry, json!([4, 5]));
        assert!(!layer.annotations[0].id.is_empty());
        assert_eq!(layer.annotations[1].kind, AnnotationKind::Arrow);
        assert_eq!(layer.annotations[1].id, "a1");
        assert_eq!(layer.style.opacity, 0.5);
        assert_eq!(layer.style.fill_color.as_deref(), Some("#00ff00"));
        assert_eq!(layer.style.stroke_color.as_deref(), Some("#00ff00"));
    }

    #[tokio::test]
    async fn targets_resolve_by_name_id_or_active() {
        let sandbox = MemSandbox::default();
        let a = image_file("a.tif");
        let b = image_file("b.tif");
        let ctx = ctx_with(vec![a.clone(), b.clone()], Some(a.id));
        let artifact = |target: Option<String>| SandboxAction::AttachArtifact {
            target_file: target,
            name: None,
            path: Some("/.session/hist.png".into()),
            source: None,
            artifact_type: None,
        };
        let actions = vec![
            artifact(Some("b.tif".into())),
            artifact(Some(b.id.to_string())),
            artifact(None),
            artifact(Some("missing.tif".into())),
        ];

        let report = Harvester::new()
            .harvest(&sandbox, ok_run(""), vec![], actions, &ctx)
            .await;
        let targets: Vec<Uuid> = report
            .mutations
            .iter()
            .map(|m| match m {
                WorkspaceMutation::AttachArtifact { file_id, artifact } => {
                    assert_eq!(artifact.name, "hist.png");
                    assert_eq!(artifact.kind, "PLOT");
                    assert_eq!(artifact.source, "/.session/hist.png");
                    *file_id
                }
                other => panic!("unexpected mutation {other:?}"),
            })
            .collect();
        assert_eq!(targets, vec![b.id, b.id, a.id]);
        assert_eq!(report.output, "[System] Attached 3 related artifact(s).");
    }

    #[tokio::test]
    async fn no_active_file_skips_untargeted_actions() {
        let sandbox = MemSandbox::default();
        let ctx = ctx_with(vec![image_file("a.tif")], None);
        let actions = vec![SandboxAction::AddLayer {
            target_file: None,
            name: None,
            layer_type: None,
            source: Value::String("/.session/mask.png".into()),
            style: Value::Null,
        }];
        let report = Harvester::new()
            .harvest(&sandbox, ok_run("done"), vec![], actions, &ctx)
            .await;
        assert!(report.mutations.is_empty());
        assert_eq!(report.output, "done");
    }

    #[tokio::test]
    async fn layer_data_update_sees_layers_from_same_drain() {
        let sandbox = MemSandbox::default();
        let file = image_file("cells.tif");
        let ctx = ctx_with(vec![file.clone()], Some(file.id));
        let actions = vec![
            SandboxAction::AddLayer {
                target_file: None,
                name: Some("Mask".into()),
                layer_type: Some("RASTER".into()),
                source: Value::String("/.session/mask.png".into()),
                style: Value::Null,
            },
            serde_json::from_value(json!({
                "type": "update_layer_data",
                "layer_name": "Mask",
                "blocks": [{"type": "kv", "data": {"area": 12.5}}]
            }))
            .unwrap(),
        ];

        let report = Harvester::new()
            .harvest(&sandbox, ok_run(""), vec![], actions, &ctx)
            .await;
        assert_eq!(report.mutations.len(), 2);
        let WorkspaceMutation::AddLayer { layer, .. } = &report.mutations[0] else {
            panic!("expected add layer");
        };
        assert_eq!(layer.source.as_deref(), Some("/.session/mask.png"));
        let WorkspaceMutation::UpdateLayerData {
            layer_id, blocks, ..
        } = &report.mutations[1]
        else {
            panic!("expected layer data update");
        };
        assert_eq!(*layer_id, layer.id);
        assert!(!blocks[0].id().is_empty());
        assert!(report.output.contains("[System] Updated stats/data for 1 layer(s)."));
    }

    #[tokio::test]
    async fn output_lists_stdout_result_and_generated_files() {
        let sandbox = MemSandbox::default()
            .with_file("/.session/plot.png", b"png")
            .await
            .with_file("/workspace/data/table.csv", b"a,b")
            .await;
        let ctx = ctx_with(vec![], None);
        let run = RunOutput {
            stdout: "hello".into(),
            result: Some(json!(42)),
            error: None,
        };
        let changed = vec![
            "/.session/plot.png".to_string(),
            "/workspace/data/table.csv".to_string(),
            "/.session/vanished.png".to_string(),
        ];

        let report = Harvester::new()
            .harvest(&sandbox, run, changed, vec![], &ctx)
            .await;
        assert_eq!(
            report.output,
            "hello\n42\n[System] Generated files: plot.png (session), table.csv (project)"
        );
        assert_eq!(report.generated_files.len(), 2);
        assert_eq!(report.generated_files[0].mime_type, "image/png");
        assert_eq!(report.generated_files[1].category, FileCategory::Project);
    }

    #[tokio::test]
    async fn analysis_result_value_updates_metadata() {
        let sandbox = MemSandbox::default();
        let file = image_file("cells.tif");
        let ctx = ctx_with(vec![file.clone()], None);
        let run = RunOutput {
            stdout: String::new(),
            result: Some(json!({
                "type": "analysis_result",
                "target_file": "cells.tif",
                "metrics": {"count": 7}
            })),
            error: None,
        };
        let report = Harvester::new()
            .harvest(&sandbox, run, vec![], vec![], &ctx)
            .await;
        let WorkspaceMutation::UpdateFileMetadata { file_id, metadata } = &report.mutations[0]
        else {
            panic!("expected metadata update");
        };
        assert_eq!(*file_id, file.id);
        assert_eq!(metadata["count"], 7);
        assert!(report.output.contains("\"analysis_result\""));
    }

    #[tokio::test]
    async fn load_role_registers_persona() {
        let package = json!({
            "manifest": {"id": "cell-counter", "name": "Cell Counter"},
            "system_prompt": "Count cells.",
            "helpers": []
        });
        let sandbox = MemSandbox::default()
            .with_file("/.session/counter.role", package.to_string().as_bytes())
            .await;
        let registry = Arc::new(PersonaRegistry::new());
        let harvester = Harvester::new().with_personas(Arc::clone(&registry));
        let ctx = ctx_with(vec![], None);
        let actions = vec![
            SandboxAction::LoadRoleFromFile {
                path: "/.session/counter.role".into(),
            },
            SandboxAction::LoadRoleFromFile {
                path: "/.session/missing.role".into(),
            },
        ];

        let report = harvester
            .harvest(&sandbox, ok_run(""), vec![], actions, &ctx)
            .await;
        assert!(registry.get("cell-counter").await.is_some());
        assert!(
            report
                .output
                .starts_with("[System] Successfully registered new role: Cell Counter (cell-counter).")
        );
        assert!(report.output.contains("[System] Error loading generated role:"));
        assert_eq!(
            report.mutations,
            vec![WorkspaceMutation::PersonaRegistered {
                persona_id: "cell-counter".into(),
                name: "Cell Counter".into(),
            }]
        );
    }
}
