//! Image generation tool.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::conversation::{FileCategory, FileEntry, GeneratedFile};
use crate::error::ModelError;
use crate::sandbox::SESSION_ROOT;
use crate::tools::tool::{Tool, ToolContext, ToolError, ToolOutput, require_str};

/// Model used when the thread does not configure one.
pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.5-flash-image";

/// Inline image passed to or returned from a generator.
#[derive(Debug, Clone, PartialEq)]
pub struct InlineImage {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Backend that turns a prompt (and optional reference image) into images.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        reference: Option<InlineImage>,
    ) -> Result<Vec<InlineImage>, ModelError>;
}

pub struct GenerateImageTool {
    generator: Arc<dyn ImageGenerator>,
}

impl GenerateImageTool {
    pub fn new(generator: Arc<dyn ImageGenerator>) -> Self {
        Self { generator }
    }

    async fn load_reference(
        &self,
        query: &str,
        ctx: &ToolContext,
    ) -> Result<InlineImage, String> {
        let not_found = || format!("Error: Reference file '{query}' not found in the workspace.");
        let file = find_reference(&ctx.files, query).ok_or_else(not_found)?;
        let store = ctx.store.as_ref().ok_or_else(not_found)?;
        match store.get_file_blob(file.id).await {
            Ok(Some(bytes)) => Ok(InlineImage {
                mime_type: file.mime_type.clone(),
                bytes,
            }),
            Ok(None) => Err(not_found()),
            Err(e) => Err(format!("Error: could not read reference file '{query}': {e}")),
        }
    }
}

/// Match by name, virtual path, path suffix or id.
fn find_reference<'a>(files: &'a [FileEntry], query: &str) -> Option<&'a FileEntry> {
    let suffix = format!("/{query}");
    files.iter().find(|f| {
        f.name == query
            || f.virtual_path.as_deref() == Some(query)
            || f.virtual_path.as_deref().is_some_and(|p| p.ends_with(&suffix))
            || f.id.to_string() == query
    })
}

#[async_trait]
impl Tool for GenerateImageTool {
    fn name(&self) -> &str {
        "generate_image"
    }

    fn description(&self) -> &str {
        "Generates an image from a text prompt. Call this tool when the user asks to create, \
         generate, or draw a visual image."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "Detailed description of the image to generate."
                },
                "reference_file_path": {
                    "type": "string",
                    "description": "Optional. The exact name or path of a file in the workspace to use as reference (e.g., 'sketch.png')."
                }
            },
            "required": ["prompt"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let prompt = require_str(&params, "prompt")?;
        let model = ctx.image_model.as_deref().unwrap_or(DEFAULT_IMAGE_MODEL);

        let reference = match params
            .get("reference_file_path")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|q| !q.is_empty())
        {
            Some(query) => match self.load_reference(query, ctx).await {
                Ok(image) => Some(image),
                Err(message) => return Ok(ToolOutput::text(message)),
            },
            None => None,
        };

        let images = match self.generator.generate(model, prompt, reference).await {
            Ok(images) => images,
            Err(e) => {
                tracing::warn!(model = %model, "Image generation failed: {}", e);
                return Ok(ToolOutput::failure(
                    format!("Error generating image: {e}"),
                    e.to_string(),
                ));
            }
        };

        if images.is_empty() {
            return Ok(ToolOutput::text("No images generated."));
        }

        let stamp = Utc::now().timestamp_millis();
        let files: Vec<GeneratedFile> = images
            .into_iter()
            .enumerate()
            .map(|(n, image)| {
                let name = format!("gen_{stamp}_{n}.png");
                GeneratedFile {
                    virtual_path: format!("{SESSION_ROOT}/{name}"),
                    name,
                    mime_type: image.mime_type,
                    category: FileCategory::Session,
                    bytes: image.bytes,
                }
            })
            .collect();

        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        let data = serde_json::json!({ "model": model, "files": names });
        Ok(
            ToolOutput::text(format!("Successfully generated {} image(s).", files.len()))
                .with_data(data)
                .with_files(files),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use uuid::Uuid;

    use super::*;
    use crate::store::{InMemoryStore, Store};

    #[derive(Default)]
    struct FakeGenerator {
        count: usize,
        seen: Mutex<Vec<(String, Option<InlineImage>)>>,
    }

    #[async_trait]
    impl ImageGenerator for FakeGenerator {
        async fn generate(
            &self,
            model: &str,
            _prompt: &str,
            reference: Option<InlineImage>,
        ) -> Result<Vec<InlineImage>, ModelError> {
            self.seen.lock().unwrap().push((model.to_string(), reference));
            Ok((0..self.count)
                .map(|i| InlineImage {
                    mime_type: "image/png".into(),
                    bytes: vec![i as u8],
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn generates_session_files() {
        let generator = Arc::new(FakeGenerator {
            count: 2,
            ..Default::default()
        });
        let tool = GenerateImageTool::new(generator.clone());
        let ctx = ToolContext::new(Uuid::new_v4(), Vec::new())
            .with_image_model(Some("custom-image".into()));

        let out = tool
            .execute(serde_json::json!({"prompt": "cat"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out.result, "Successfully generated 2 image(s).");
        assert_eq!(out.generated_files.len(), 2);
        let data = out.structured_data.as_ref().unwrap();
        assert_eq!(data["model"], "custom-image");
        assert_eq!(data["files"][1], out.generated_files[1].name.as_str());
        let file = &out.generated_files[0];
        assert!(file.name.starts_with("gen_") && file.name.ends_with("_0.png"));
        assert_eq!(file.virtual_path, format!("/.session/{}", file.name));
        assert_eq!(file.category, FileCategory::Session);
        assert_eq!(generator.seen.lock().unwrap()[0].0, "custom-image");
    }

    #[tokio::test]
    async fn empty_generation_and_default_model() {
        let generator = Arc::new(FakeGenerator::default());
        let tool = GenerateImageTool::new(generator.clone());
        let ctx = ToolContext::new(Uuid::new_v4(), Vec::new());
        let out = tool
            .execute(serde_json::json!({"prompt": "cat"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out.result, "No images generated.");
        assert_eq!(generator.seen.lock().unwrap()[0].0, DEFAULT_IMAGE_MODEL);
    }

    #[tokio::test]
    async fn resolves_reference_by_path_suffix() {
        let store = Arc::new(InMemoryStore::new());
        let sketch = FileEntry::new("sketch.png", "image/png", FileCategory::Project)
            .with_virtual_path("/workspace/data/drafts/sketch_v2.png");
        store.add_file(&sketch, Some(vec![7])).await.unwrap();

        let generator = Arc::new(FakeGenerator {
            count: 1,
            ..Default::default()
        });
        let tool = GenerateImageTool::new(generator.clone());
        let ctx = ToolContext::new(Uuid::new_v4(), vec![sketch])
            .with_store(store as Arc<dyn Store>);

        tool.execute(
            serde_json::json!({"prompt": "ink it", "reference_file_path": "drafts/sketch_v2.png"}),
            &ctx,
        )
        .await
        .unwrap();
        let seen = generator.seen.lock().unwrap();
        assert_eq!(seen[0].1.as_ref().map(|r| r.bytes.clone()), Some(vec![7]));
    }

    #[tokio::test]
    async fn missing_reference_is_reported_as_result() {
        let tool = GenerateImageTool::new(Arc::new(FakeGenerator::default()));
        let ctx = ToolContext::new(Uuid::new_v4(), Vec::new());
        let out = tool
            .execute(
                serde_json::json!({"prompt": "x", "reference_file_path": "ghost.png"}),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(
            out.result,
            "Error: Reference file 'ghost.png' not found in the workspace."
        );
        assert!(out.generated_files.is_empty());
    }
}
