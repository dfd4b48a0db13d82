//! Execute-and-harvest pipeline around a [`Sandbox`].

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SandboxError;
use crate::sandbox::harvest::diff_snapshots;
use crate::sandbox::{HarvestReport, Harvester, Sandbox, SandboxContext};
use crate::tools::ToolContext;

/// Runs code in the sandbox and converts the outcome into a [`HarvestReport`].
///
/// Holds its lock for the whole pipeline, so two runs never overlap.
pub struct CodeRunner {
    sandbox: Arc<dyn Sandbox>,
    harvester: Harvester,
    /// Workspace files already written into the sandbox.
    mounted: Mutex<HashSet<Uuid>>,
}

impl CodeRunner {
    pub fn new(sandbox: Arc<dyn Sandbox>, harvester: Harvester) -> Self {
        Self {
            sandbox,
            harvester,
            mounted: Mutex::new(HashSet::new()),
        }
    }

    pub fn sandbox(&self) -> Arc<dyn Sandbox> {
        Arc::clone(&self.sandbox)
    }

    /// Mount, sync, snapshot, run, snapshot, diff, drain, harvest.
    ///
    /// Errors inside the executed code are reported through the returned
    /// report; `Err` means the sandbox itself could not be driven.
    pub async fn execute(
        &self,
        code: &str,
        ctx: &ToolContext,
    ) -> Result<HarvestReport, SandboxError> {
        let mut mounted = self.mounted.lock().await;
        self.mount_files(ctx, &mut mounted).await;

        let context = SandboxContext::from_files(&ctx.files, ctx.active_file_id);
        self.sandbox.sync_context(&context).await?;

        let before = self.sandbox.snapshot().await?;
        let run = self.sandbox.run_code(code).await?;
        let after = self.sandbox.snapshot().await?;
        let changed = diff_snapshots(&before, &after);
        let actions = self.sandbox.drain_actions().await?;

        debug!(
            changed = changed.len(),
            actions = actions.len(),
            failed = run.error.is_some(),
            "Sandbox run finished"
        );

        Ok(self
            .harvester
            .harvest(self.sandbox.as_ref(), run, changed, actions, ctx)
            .await)
    }

    /// Record a host file id as present in the sandbox.
    pub async fn mark_mounted(&self, id: Uuid) {
        self.mounted.lock().await.insert(id);
    }

    async fn mount_files(&self, ctx: &ToolContext, mounted: &mut HashSet<Uuid>) {
        let Some(store) = &ctx.store else {
            return;
        };
        for file in &ctx.files {
            if mounted.contains(&file.id) {
                continue;
            }
            let bytes = match store.get_file_blob(file.id).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => {
                    warn!(file = %file.name, "Failed to load file for sandbox: {}", e);
                    continue;
                }
            };
            let path = file.sandbox_path();
            match self.sandbox.write_file(&path, &bytes).await {
                Ok(()) => {
                    mounted.insert(file.id);
                    debug!(file = %file.name, path = %path, "Mounted file into sandbox");
                }
                Err(e) => warn!(file = %file.name, "Failed to mount file: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::{Duration, SystemTime};

    use async_trait::async_trait;

    use super::*;
    use crate::conversation::{FileCategory, FileEntry};
    use crate::sandbox::{RunOutput, SandboxAction, Snapshot};
    use crate::store::{InMemoryStore, Store};

    /// Writes `out.png` on every run and queues one log action.
    #[derive(Default)]
    struct ScriptSandbox {
        files: std::sync::Mutex<HashMap<String, (Vec<u8>, SystemTime)>>,
        actions: std::sync::Mutex<Vec<SandboxAction>>,
        contexts: std::sync::Mutex<Vec<SandboxContext>>,
        runs: std::sync::Mutex<u64>,
    }

    #[async_trait]
    impl Sandbox for ScriptSandbox {
        async fn run_code(&self, source: &str) -> Result<RunOutput, SandboxError> {
            let mut runs = self.runs.lock().unwrap();
            *runs += 1;
            let stamp = SystemTime::UNIX_EPOCH + Duration::from_secs(*runs);
            self.files
                .lock()
                .unwrap()
                .insert("/.session/out.png".into(), (vec![1, 2, 3], stamp));
            self.actions.lock().unwrap().push(SandboxAction::Log {
                message: "ran".into(),
                level: None,
            });
            Ok(RunOutput {
                stdout: format!("ran {source}"),
                ..Default::default()
            })
        }
        async fn snapshot(&self) -> Result<Snapshot, SandboxError> {
            Ok(self
                .files
                .lock()
                .unwrap()
                .iter()
                .filter(|(p, _)| p.starts_with("/.session") || p.starts_with("/workspace/data"))
                .map(|(p, (_, t))| (p.clone(), *t))
                .collect())
        }
        async fn drain_actions(&self) -> Result<Vec<SandboxAction>, SandboxError> {
            Ok(std::mem::take(&mut *self.actions.lock().unwrap()))
        }
        async fn read_file(&self, path: &str) -> Result<Vec<u8>, SandboxError> {
            self.files
                .lock()
                .unwrap()
                .get(path)
                .map(|(b, _)| b.clone())
                .ok_or_else(|| SandboxError::PathNotFound(path.to_string()))
        }
        async fn write_file(&self, path: &str, bytes: &[u8]) -> Result<(), SandboxError> {
            self.files
                .lock()
                .unwrap()
                .insert(path.to_string(), (bytes.to_vec(), SystemTime::UNIX_EPOCH));
            Ok(())
        }
        async fn sync_context(&self, context: &SandboxContext) -> Result<(), SandboxError> {
            self.contexts.lock().unwrap().push(context.clone());
            Ok(())
        }
        async fn install_package(&self, _package: &str) -> Result<(), SandboxError> {
            Ok(())
        }
        async fn import_module(&self, _module: &str) -> Result<(), SandboxError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn mounts_syncs_and_harvests() {
        let store = Arc::new(InMemoryStore::new());
        let file = FileEntry::new("cells.tif", "image/tiff", FileCategory::Project);
        store.add_file(&file, Some(vec![9, 9])).await.unwrap();

        let sandbox = Arc::new(ScriptSandbox::default());
        let runner = CodeRunner::new(sandbox.clone(), Harvester::new());

        let mut ctx = ToolContext::new(Uuid::new_v4(), vec![file.clone()]);
        ctx.active_file_id = Some(file.id);
        ctx.store = Some(store.clone() as Arc<dyn Store>);

        let report = runner.execute("x", &ctx).await.unwrap();
        assert_eq!(report.generated_files.len(), 1);
        assert_eq!(report.generated_files[0].name, "out.png");
        assert!(report.output.starts_with("ran x"));
        assert!(report.output.contains("[System] Generated files: out.png (session)"));

        // Project file was mounted at its default path (mtime unchanged, so not "generated").
        assert!(sandbox.read_file("/workspace/data/cells.tif").await.is_ok());
        let contexts = sandbox.contexts.lock().unwrap().clone();
        assert_eq!(contexts[0].active_file.as_ref().map(|f| f.id), Some(file.id));

        // Second run rewrites out.png with a new mtime; the mount is not repeated.
        sandbox
            .write_file("/workspace/data/cells.tif", &[0])
            .await
            .unwrap();
        let report = runner.execute("y", &ctx).await.unwrap();
        assert_eq!(report.generated_files.len(), 1);
        assert_eq!(
            sandbox.read_file("/workspace/data/cells.tif").await.unwrap(),
            vec![0]
        );
    }
}
