//! Sandboxed code execution and side-effect harvesting.
//!
//! The sandbox itself is a collaborator behind the [`Sandbox`] trait. A run
//! produces captured output plus two side channels: a filesystem snapshot
//! diff (binary outputs) and a drained queue of [`SandboxAction`] intents
//! (layers, artifacts, metrics, persona registration).

pub mod action;
pub mod harvest;
pub mod process;
pub mod runner;

use std::collections::BTreeMap;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conversation::{FileEntry, FileKind};
use crate::error::SandboxError;

pub use action::SandboxAction;
pub use harvest::{HarvestReport, Harvester, WorkspaceMutation};
pub use process::ProcessSandbox;
pub use runner::CodeRunner;

/// Root for scratch output owned by the current thread.
pub const SESSION_ROOT: &str = "/.session";
/// Root for project data shared across threads.
pub const PROJECT_ROOT: &str = "/workspace/data";
/// Root for persona helper modules.
pub const LIB_ROOT: &str = "/lib";

/// Captured result of a single code execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOutput {
    pub stdout: String,
    /// Value of the final expression, if any.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Sandbox path to last-modified time.
pub type Snapshot = BTreeMap<String, SystemTime>;

/// File summary handed to sandbox-side helpers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxFileInfo {
    pub id: Uuid,
    pub name: String,
    pub path: String,
    pub kind: FileKind,
    pub layers: Vec<String>,
}

impl From<&FileEntry> for SandboxFileInfo {
    fn from(file: &FileEntry) -> Self {
        Self {
            id: file.id,
            name: file.name.clone(),
            path: file.sandbox_path(),
            kind: file.kind,
            layers: file.layers.iter().map(|l| l.name.clone()).collect(),
        }
    }
}

/// Workspace view synchronized into the sandbox before each run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxContext {
    pub active_file: Option<SandboxFileInfo>,
    pub files: Vec<SandboxFileInfo>,
}

impl SandboxContext {
    pub fn from_files(files: &[FileEntry], active_file_id: Option<Uuid>) -> Self {
        Self {
            active_file: active_file_id
                .and_then(|id| files.iter().find(|f| f.id == id))
                .map(SandboxFileInfo::from),
            files: files.iter().map(SandboxFileInfo::from).collect(),
        }
    }
}

/// A stateful code-execution environment.
///
/// Implementations persist imports, installed packages and files between
/// calls. Callers never issue two runs concurrently.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Execute source code, capturing stdout, the final value and any error.
    async fn run_code(&self, source: &str) -> Result<RunOutput, SandboxError>;

    /// Modification times of every file under the session and project roots.
    async fn snapshot(&self) -> Result<Snapshot, SandboxError>;

    /// Take every queued action. A second call returns only newer actions.
    async fn drain_actions(&self) -> Result<Vec<SandboxAction>, SandboxError>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SandboxError>;

    async fn write_file(&self, path: &str, bytes: &[u8]) -> Result<(), SandboxError>;

    /// Publish the active file and file list to sandbox-side helpers.
    async fn sync_context(&self, context: &SandboxContext) -> Result<(), SandboxError>;

    async fn install_package(&self, package: &str) -> Result<(), SandboxError>;

    async fn import_module(&self, module: &str) -> Result<(), SandboxError>;
}
