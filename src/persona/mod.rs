//! Personas: system prompt, sandbox packages and helper modules bundled together.

pub mod activation;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::PersonaError;
use crate::store::Store;

pub use activation::PersonaActivator;

/// Id of the built-in fallback persona.
pub const GENERIC_PERSONA_ID: &str = "generic";

/// Declared identity and sandbox requirements of a persona.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaManifest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    /// Packages installed into the sandbox before first use.
    #[serde(default)]
    pub packages: Vec<String>,
    /// Helper filenames, in load order.
    #[serde(default)]
    pub helpers: Vec<String>,
    #[serde(default)]
    pub artifact_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_budget: Option<u32>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// Python source shipped with a persona.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaHelper {
    pub filename: String,
    pub source: String,
    /// Module name to import after writing the file.
    pub module_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub manifest: PersonaManifest,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub helpers: Vec<PersonaHelper>,
    #[serde(default)]
    pub built_in: bool,
}

impl Persona {
    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    /// The default general-purpose persona.
    pub fn generic() -> Self {
        Self {
            manifest: PersonaManifest {
                id: GENERIC_PERSONA_ID.to_string(),
                name: "General Assistant".to_string(),
                description: "General analysis with the core sandbox helpers.".to_string(),
                version: default_version(),
                packages: Vec::new(),
                helpers: Vec::new(),
                artifact_types: vec!["PLOT".to_string(), "DATA".to_string()],
                thinking_budget: None,
            },
            system_prompt: concat!(
                "You are a careful analysis assistant. ",
                "Run Python by emitting a ```python:run fenced block; ",
                "use the `core` module to add layers and attach artifacts."
            )
            .to_string(),
            helpers: Vec::new(),
            built_in: true,
        }
    }

    /// Parse a persona package (a JSON document). Packages are never built-in.
    pub fn from_package(bytes: &[u8]) -> Result<Self, PersonaError> {
        let mut persona: Persona = serde_json::from_slice(bytes)
            .map_err(|e| PersonaError::InvalidPackage(e.to_string()))?;
        if persona.manifest.id.trim().is_empty() {
            return Err(PersonaError::InvalidPackage("manifest id is empty".into()));
        }
        if persona.manifest.name.trim().is_empty() {
            persona.manifest.name = persona.manifest.id.clone();
        }
        if persona.manifest.helpers.is_empty() {
            persona.manifest.helpers = persona.helpers.iter().map(|h| h.filename.clone()).collect();
        }
        persona.built_in = false;
        Ok(persona)
    }
}

/// Registry of available personas.
pub struct PersonaRegistry {
    personas: RwLock<HashMap<String, Persona>>,
    store: Option<Arc<dyn Store>>,
}

impl PersonaRegistry {
    /// Create a registry holding only the built-in personas.
    pub fn new() -> Self {
        let generic = Persona::generic();
        Self {
            personas: RwLock::new(HashMap::from([(generic.manifest.id.clone(), generic)])),
            store: None,
        }
    }

    /// Persist user-registered personas through the store.
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Load previously persisted personas. Returns how many were loaded.
    pub async fn load_persisted(&self) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };
        match store.list_personas().await {
            Ok(stored) => {
                let mut personas = self.personas.write().await;
                let mut loaded = 0;
                for persona in stored {
                    if personas.get(persona.id()).is_some_and(|p| p.built_in) {
                        continue;
                    }
                    personas.insert(persona.id().to_string(), persona);
                    loaded += 1;
                }
                loaded
            }
            Err(e) => {
                tracing::warn!("Failed to load personas: {}", e);
                0
            }
        }
    }

    /// Register (or replace) a persona. Built-ins cannot be replaced.
    pub async fn register(&self, persona: Persona) -> Result<(), PersonaError> {
        let id = persona.id().to_string();
        {
            let mut personas = self.personas.write().await;
            if personas.get(&id).is_some_and(|p| p.built_in) {
                return Err(PersonaError::BuiltIn { id });
            }
            personas.insert(id.clone(), persona.clone());
        }

        if let Some(store) = &self.store
            && let Err(e) = store.put_persona(&persona).await
        {
            tracing::warn!(persona = %id, "Failed to persist persona: {}", e);
        }
        tracing::info!(persona = %id, "Registered persona");
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Persona> {
        self.personas.read().await.get(id).cloned()
    }

    /// Look up a persona, falling back to the generic one.
    pub async fn resolve(&self, id: Option<&str>) -> Persona {
        let personas = self.personas.read().await;
        id.and_then(|id| personas.get(id))
            .or_else(|| personas.get(GENERIC_PERSONA_ID))
            .cloned()
            .unwrap_or_else(Persona::generic)
    }

    /// All personas, sorted by id.
    pub async fn list(&self) -> Vec<Persona> {
        let mut all: Vec<Persona> = self.personas.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.manifest.id.cmp(&b.manifest.id));
        all
    }

    pub async fn remove(&self, id: &str) -> Result<Persona, PersonaError> {
        let removed = {
            let mut personas = self.personas.write().await;
            match personas.get(id) {
                None => return Err(PersonaError::NotFound { id: id.to_string() }),
                Some(p) if p.built_in => return Err(PersonaError::BuiltIn { id: id.to_string() }),
                Some(_) => personas.remove(id),
            }
        };
        if let Some(store) = &self.store
            && let Err(e) = store.delete_persona(id).await
        {
            tracing::warn!(persona = %id, "Failed to delete persona: {}", e);
        }
        removed.ok_or_else(|| PersonaError::NotFound { id: id.to_string() })
    }
}

impl Default for PersonaRegistry {
    fn default() -> Self {
        Self::new()
    }
}
