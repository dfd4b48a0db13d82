//! Sandbox code execution as a tool.

use std::sync::Arc;

use async_trait::async_trait;

use crate::sandbox::CodeRunner;
use crate::tools::tool::{Tool, ToolContext, ToolError, ToolOutput, require_str};

/// Runs Python in the session sandbox and reports harvested side effects.
///
/// Not declared to the model: code normally arrives as a `python:run`
/// fence, but a direct call by name is still honoured.
pub struct RunPythonTool {
    runner: Arc<CodeRunner>,
}

impl RunPythonTool {
    pub fn new(runner: Arc<CodeRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl Tool for RunPythonTool {
    fn name(&self) -> &str {
        "run_python"
    }

    fn description(&self) -> &str {
        "Executes Python code in the sandbox. Use the 'core' module for workspace \
         operations (layers, artifacts, metrics)."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "The Python code to execute."
                }
            },
            "required": ["code"]
        })
    }

    fn exposed_to_model(&self) -> bool {
        false
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let code = require_str(&params, "code")?;
        let report = self
            .runner
            .execute(code, ctx)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        let output = match report.error {
            Some(error) => ToolOutput::failure(report.output, error),
            None => ToolOutput::text(report.output),
        };
        Ok(output
            .with_files(report.generated_files)
            .with_mutations(report.mutations))
    }
}
