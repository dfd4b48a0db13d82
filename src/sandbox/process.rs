//! Local sandbox backed by a persistent `python3` worker process.
//!
//! The sandbox filesystem is a host directory:
//! - `.session/`, `workspace/data/`: snapshot roots
//! - `lib/`: helper modules (`core.py` plus persona helpers), on `PYTHONPATH`
//! - `site/`: packages installed with `pip --target`
//! - `.runtime/`: worker script, action queue and synced context

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::sandbox::{
    LIB_ROOT, PROJECT_ROOT, RunOutput, SESSION_ROOT, Sandbox, SandboxAction, SandboxContext,
    Snapshot,
};

/// Environment variable through which the worker finds its root.
pub const ROOT_ENV: &str = "LENS_SANDBOX_ROOT";

const RUNNER_SCRIPT: &str = include_str!("python/runner.py");
const CORE_MODULE: &str = include_str!("python/core.py");

const RUNTIME_DIR: &str = ".runtime";
const SITE_DIR: &str = "site";
const ACTIONS_FILE: &str = "actions.jsonl";
const CONTEXT_FILE: &str = "context.json";

/// Stdio handles of the running worker.
struct Worker {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

/// Sandbox running code in a long-lived Python process.
///
/// Globals, imports and files persist across runs until the worker dies or
/// times out, after which the next run starts a fresh interpreter.
pub struct ProcessSandbox {
    root: PathBuf,
    python_bin: String,
    timeout: Duration,
    max_output_bytes: usize,
    worker: Mutex<Option<Worker>>,
}

impl ProcessSandbox {
    /// Prepare the root directory layout and bridge scripts.
    pub fn new(config: &SandboxConfig) -> Result<Self, SandboxError> {
        let root = std::path::absolute(&config.root_dir)?;
        for dir in [SESSION_ROOT, PROJECT_ROOT, LIB_ROOT, RUNTIME_DIR, SITE_DIR] {
            std::fs::create_dir_all(root.join(dir.trim_start_matches('/')))?;
        }
        std::fs::write(root.join(RUNTIME_DIR).join("runner.py"), RUNNER_SCRIPT)?;
        std::fs::write(
            root.join(LIB_ROOT.trim_start_matches('/')).join("core.py"),
            CORE_MODULE,
        )?;

        info!(root = %root.display(), python = %config.python_bin, "Process sandbox ready");
        Ok(Self {
            root,
            python_bin: config.python_bin.clone(),
            timeout: config.timeout,
            max_output_bytes: config.max_output_bytes,
            worker: Mutex::new(None),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a sandbox path such as `/.session/plot.png` to the host.
    pub fn host_path(&self, path: &str) -> Result<PathBuf, SandboxError> {
        let relative = path.trim_start_matches('/');
        let escapes = Path::new(relative)
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if relative.is_empty() || escapes {
            return Err(SandboxError::PathNotFound(path.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn runtime_path(&self, name: &str) -> PathBuf {
        self.root.join(RUNTIME_DIR).join(name)
    }

    fn python_path(&self) -> Result<std::ffi::OsString, SandboxError> {
        std::env::join_paths([
            self.root.join(LIB_ROOT.trim_start_matches('/')),
            self.root.join(SITE_DIR),
        ])
        .map_err(|e| SandboxError::Spawn(format!("invalid PYTHONPATH: {e}")))
    }

    fn spawn_worker(&self) -> Result<Worker, SandboxError> {
        let mut child = Command::new(&self.python_bin)
            .arg("-u")
            .arg(self.runtime_path("runner.py"))
            .current_dir(&self.root)
            .env(ROOT_ENV, &self.root)
            .env("PYTHONPATH", self.python_path()?)
            .env("MPLBACKEND", "Agg")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Spawn(format!("{}: {e}", self.python_bin)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Spawn("worker stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Spawn("worker stdout unavailable".into()))?;

        debug!(pid = ?child.id(), "Spawned sandbox worker");
        Ok(Worker {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn run_code(&self, source: &str) -> Result<RunOutput, SandboxError> {
        let mut guard = self.worker.lock().await;
        if guard.is_none() {
            *guard = Some(self.spawn_worker()?);
        }
        let Some(worker) = guard.as_mut() else {
            return Err(SandboxError::Spawn("worker unavailable".into()));
        };

        let mut request = serde_json::json!({ "code": source }).to_string();
        request.push('\n');

        let outcome = tokio::time::timeout(self.timeout, async {
            worker.stdin.write_all(request.as_bytes()).await?;
            worker.stdin.flush().await?;
            worker.stdout.next_line().await
        })
        .await;

        match outcome {
            Ok(Ok(Some(line))) => match serde_json::from_str::<RunOutput>(&line) {
                Ok(mut output) => {
                    output.stdout = truncate_output(&output.stdout, self.max_output_bytes);
                    Ok(output)
                }
                Err(e) => {
                    // Replies are paired with requests by order, so the stream is unusable.
                    if let Some(mut worker) = guard.take() {
                        let _ = worker.child.kill().await;
                    }
                    warn!(error = %e, "Unreadable sandbox reply, worker restarted");
                    Err(SandboxError::Protocol(format!("bad worker response: {e}")))
                }
            },
            Ok(Ok(None)) => {
                *guard = None;
                Err(SandboxError::Protocol("sandbox worker exited".into()))
            }
            Ok(Err(e)) => {
                *guard = None;
                Err(SandboxError::Io(e))
            }
            Err(_) => {
                if let Some(mut worker) = guard.take() {
                    let _ = worker.child.kill().await;
                }
                warn!(timeout = ?self.timeout, "Sandbox run timed out, worker restarted");
                Err(SandboxError::Timeout(self.timeout))
            }
        }
    }

    async fn snapshot(&self) -> Result<Snapshot, SandboxError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let mut snapshot = Snapshot::new();
            for virtual_root in [SESSION_ROOT, PROJECT_ROOT] {
                let dir = root.join(virtual_root.trim_start_matches('/'));
                walk(&root, &dir, &mut snapshot)?;
            }
            Ok::<_, SandboxError>(snapshot)
        })
        .await
        .map_err(|e| SandboxError::Protocol(format!("snapshot task failed: {e}")))?
    }

    async fn drain_actions(&self) -> Result<Vec<SandboxAction>, SandboxError> {
        let path = self.runtime_path(ACTIONS_FILE);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        tokio::fs::write(&path, b"").await?;

        let mut actions = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<SandboxAction>(line) {
                Ok(action) => actions.push(action),
                Err(e) => warn!("Skipping malformed sandbox action: {}", e),
            }
        }
        Ok(actions)
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SandboxError> {
        let host = self.host_path(path)?;
        tokio::fs::read(&host).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SandboxError::PathNotFound(path.to_string()),
            _ => SandboxError::Io(e),
        })
    }

    async fn write_file(&self, path: &str, bytes: &[u8]) -> Result<(), SandboxError> {
        let host = self.host_path(path)?;
        if let Some(parent) = host.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&host, bytes).await?;
        Ok(())
    }

    async fn sync_context(&self, context: &SandboxContext) -> Result<(), SandboxError> {
        let json = serde_json::to_vec_pretty(context)
            .map_err(|e| SandboxError::Protocol(format!("context encoding failed: {e}")))?;
        tokio::fs::write(self.runtime_path(CONTEXT_FILE), json).await?;
        Ok(())
    }

    async fn install_package(&self, package: &str) -> Result<(), SandboxError> {
        if package.is_empty() || !package.chars().all(is_package_char) {
            return Err(SandboxError::Protocol(format!("invalid package spec: {package}")));
        }

        let child = Command::new(&self.python_bin)
            .args(["-m", "pip", "install", "--quiet", "--disable-pip-version-check"])
            .arg("--target")
            .arg(self.root.join(SITE_DIR))
            .arg(package)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Spawn(format!("pip: {e}")))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| SandboxError::Timeout(self.timeout))??;

        if output.status.success() {
            info!(package = %package, "Installed sandbox package");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(SandboxError::Protocol(format!(
                "pip install {package} failed: {}",
                truncate_output(stderr.trim(), 2048)
            )))
        }
    }

    async fn import_module(&self, module: &str) -> Result<(), SandboxError> {
        let valid = !module.is_empty()
            && module.split('.').all(|seg| {
                !seg.is_empty() && seg.chars().all(|c| c.is_alphanumeric() || c == '_')
            });
        if !valid {
            return Err(SandboxError::Protocol(format!("invalid module name: {module}")));
        }
        let output = self.run_code(&format!("import {module}")).await?;
        match output.error {
            Some(error) => Err(SandboxError::Protocol(error)),
            None => Ok(()),
        }
    }
}

fn is_package_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(c, '-' | '_' | '.' | '=' | '<' | '>' | '[' | ']' | ',' | '!' | '~')
}

/// Record every regular file under `dir` by its sandbox path.
fn walk(root: &Path, dir: &Path, snapshot: &mut Snapshot) -> Result<(), SandboxError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(root, &path, snapshot)?;
        } else if file_type.is_file() {
            let modified = entry.metadata()?.modified()?;
            if let Ok(relative) = path.strip_prefix(root) {
                let parts: Vec<String> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                snapshot.insert(format!("/{}", parts.join("/")), modified);
            }
        }
    }
    Ok(())
}

/// Keep the head and tail of oversized output.
fn truncate_output(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let half = max / 2;
    let head_end = floor_char_boundary(s, half);
    let tail_start = floor_char_boundary(s, s.len() - half);
    format!(
        "{}\n\n... [truncated {} bytes] ...\n\n{}",
        &s[..head_end],
        s.len() - max,
        &s[tail_start..]
    )
}

fn floor_char_boundary(s: &str, i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    let mut i = i;
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox(dir: &tempfile::TempDir) -> ProcessSandbox {
        let config = SandboxConfig {
            root_dir: dir.path().to_path_buf(),
            ..SandboxConfig::default()
        };
        ProcessSandbox::new(&config).unwrap()
    }

    #[test]
    fn layout_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox(&dir);
        assert!(sandbox.root().join(".session").is_dir());
        assert!(sandbox.root().join("workspace/data").is_dir());
        assert!(sandbox.root().join("lib/core.py").is_file());
        assert!(sandbox.root().join(".runtime/runner.py").is_file());
    }

    #[test]
    fn host_path_rejects_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox(&dir);
        assert!(sandbox.host_path("/.session/../../etc/passwd").is_err());
        assert!(sandbox.host_path("/").is_err());
        assert_eq!(
            sandbox.host_path("/.session/a.png").unwrap(),
            sandbox.root().join(".session/a.png")
        );
    }

    #[tokio::test]
    async fn snapshot_covers_session_and_project_only() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox(&dir);
        sandbox.write_file("/.session/plots/a.png", b"a").await.unwrap();
        sandbox.write_file("/workspace/data/t.csv", b"t").await.unwrap();
        sandbox.write_file("/lib/helper.py", b"x = 1").await.unwrap();

        let snapshot = sandbox.snapshot().await.unwrap();
        let paths: Vec<&str> = snapshot.keys().map(String::as_str).collect();
        assert_eq!(paths, vec!["/.session/plots/a.png", "/workspace/data/t.csv"]);
        assert_eq!(sandbox.read_file("/.session/plots/a.png").await.unwrap(), b"a");
        assert!(matches!(
            sandbox.read_file("/.session/missing.png").await,
            Err(SandboxError::PathNotFound(_))
        ));
    }

    #[tokio::test]
    async fn drain_parses_and_clears_queue() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox(&dir);
        assert!(sandbox.drain_actions().await.unwrap().is_empty());

        let queue = concat!(
            r#"{"type": "log", "message": "hi"}"#,
            "\n",
            "not json\n",
            r#"{"type": "set_status", "status": "busy"}"#,
            "\n"
        );
        std::fs::write(sandbox.runtime_path(ACTIONS_FILE), queue).unwrap();

        let actions = sandbox.drain_actions().await.unwrap();
        assert_eq!(actions.len(), 2);
        assert!(matches!(&actions[1], SandboxAction::SetStatus { status } if status == "busy"));
        assert!(sandbox.drain_actions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn context_is_written_for_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox(&dir);
        sandbox.sync_context(&SandboxContext::default()).await.unwrap();
        let raw = std::fs::read_to_string(sandbox.runtime_path(CONTEXT_FILE)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(value["files"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_suspicious_package_and_module_names() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox(&dir);
        assert!(sandbox.install_package("numpy; rm -rf /").await.is_err());
        assert!(sandbox.import_module("os; import sys").await.is_err());
    }

    fn python_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|s| s.success())
    }

    #[tokio::test]
    async fn fd_level_output_does_not_desync_replies() {
        if !python_available() {
            eprintln!("python3 not found, skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox(&dir);

        let first = sandbox
            .run_code("import os\nos.system('echo hi')\n'first'")
            .await
            .unwrap();
        assert_eq!(first.result, Some(serde_json::json!("first")));
        assert!(first.stdout.contains("hi"));

        let second = sandbox.run_code("'second'").await.unwrap();
        assert_eq!(second.result, Some(serde_json::json!("second")));
        let third = sandbox.run_code("print('x')\n'third'").await.unwrap();
        assert_eq!(third.result, Some(serde_json::json!("third")));
        assert_eq!(third.stdout, "x\n");
    }

    #[tokio::test]
    async fn globals_persist_between_runs() {
        if !python_available() {
            eprintln!("python3 not found, skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox(&dir);
        sandbox.run_code("x = 41").await.unwrap();
        let out = sandbox.run_code("x + 1").await.unwrap();
        assert_eq!(out.result, Some(serde_json::json!(42)));

        let failed = sandbox.run_code("raise ValueError('bad')").await.unwrap();
        assert_eq!(failed.error.as_deref(), Some("ValueError: bad"));
    }

    #[test]
    fn truncation_keeps_head_and_tail() {
        let s = "a".repeat(100) + &"b".repeat(100);
        let out = truncate_output(&s, 50);
        assert!(out.starts_with("aaaa"));
        assert!(out.ends_with("bbbb"));
        assert!(out.contains("[truncated 150 bytes]"));
    }
}
