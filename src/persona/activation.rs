//! Loading a persona's packages and helpers into the sandbox.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::SandboxError;
use crate::persona::Persona;
use crate::sandbox::{LIB_ROOT, Sandbox};

/// Tracks which persona is loaded into the sandbox.
///
/// Keyed by persona id so switching personas mid-session reloads, while
/// repeated calls for the active persona are no-ops.
pub struct PersonaActivator {
    sandbox: Arc<dyn Sandbox>,
    active: Mutex<Option<String>>,
}

impl PersonaActivator {
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            sandbox,
            active: Mutex::new(None),
        }
    }

    /// Id of the persona currently loaded, if any.
    pub async fn active(&self) -> Option<String> {
        self.active.lock().await.clone()
    }

    /// Load the persona unless it is already active. Returns whether work was done.
    ///
    /// Package installs and imports are best effort; a helper that cannot be
    /// written aborts the load.
    pub async fn ensure_loaded(
        &self,
        persona: &Persona,
        force: bool,
    ) -> Result<bool, SandboxError> {
        let mut active = self.active.lock().await;
        if !force && active.as_deref() == Some(persona.id()) {
            return Ok(false);
        }

        for package in &persona.manifest.packages {
            if let Err(e) = self.sandbox.install_package(package).await {
                warn!(persona = %persona.id(), package = %package, "Package install failed: {}", e);
            }
        }

        for helper in &persona.helpers {
            let path = format!("{LIB_ROOT}/{}", helper.filename);
            self.sandbox.write_file(&path, helper.source.as_bytes()).await?;
        }

        for helper in &persona.helpers {
            if let Err(e) = self.sandbox.import_module(&helper.module_name).await {
                warn!(
                    persona = %persona.id(),
                    module = %helper.module_name,
                    "Helper import failed: {}",
                    e
                );
            }
        }

        *active = Some(persona.id().to_string());
        info!(
            persona = %persona.id(),
            packages = persona.manifest.packages.len(),
            helpers = persona.helpers.len(),
            "Persona loaded into sandbox"
        );
        Ok(true)
    }
}
