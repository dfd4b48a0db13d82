//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Agent name for identification.
    pub name: String,
    /// Model used for new threads when no hint is given.
    pub default_model: String,
    /// Persona used when none is selected.
    pub default_persona_id: String,
    /// Number of characters of the first message used as a thread title.
    pub title_max_chars: usize,
    /// Upper bound on model rounds within a single turn.
    pub max_rounds: usize,
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// Sandbox settings.
    pub sandbox: SandboxConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "lens-assist".to_string(),
            default_model: "gemini-3-pro-preview".to_string(),
            default_persona_id: "generic".to_string(),
            title_max_chars: 30,
            max_rounds: 25,
            db_path: PathBuf::from("./data/lens-assist.db"),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Build from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            name: defaults.name,
            default_model: std::env::var("LENS_ASSIST_MODEL").unwrap_or(defaults.default_model),
            default_persona_id: std::env::var("LENS_ASSIST_PERSONA")
                .unwrap_or(defaults.default_persona_id),
            title_max_chars: defaults.title_max_chars,
            max_rounds: env_parse("LENS_ASSIST_MAX_ROUNDS", defaults.max_rounds),
            db_path: std::env::var("LENS_ASSIST_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            sandbox: SandboxConfig::from_env(),
        }
    }
}

/// Settings for the local process sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Python interpreter to run.
    pub python_bin: String,
    /// Host directory backing the sandbox filesystem.
    pub root_dir: PathBuf,
    /// Per-execution timeout.
    pub timeout: Duration,
    /// Captured stdout/stderr beyond this many bytes is truncated.
    pub max_output_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            python_bin: "python3".to_string(),
            root_dir: PathBuf::from("./data/sandbox"),
            timeout: Duration::from_secs(120),
            max_output_bytes: 64 * 1024,
        }
    }
}

impl SandboxConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            python_bin: std::env::var("LENS_ASSIST_PYTHON").unwrap_or(defaults.python_bin),
            root_dir: std::env::var("LENS_ASSIST_SANDBOX_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.root_dir),
            timeout: Duration::from_secs(env_parse(
                "LENS_ASSIST_SANDBOX_TIMEOUT_SECS",
                defaults.timeout.as_secs(),
            )),
            max_output_bytes: defaults.max_output_bytes,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AgentConfig::default();
        assert_eq!(config.default_persona_id, "generic");
        assert_eq!(config.title_max_chars, 30);
        assert!(config.max_rounds > 0);
        assert_eq!(config.sandbox.python_bin, "python3");
    }

    #[test]
    fn env_parse_falls_back_on_garbage() {
        // Unset and unparseable keys both yield the default.
        assert_eq!(env_parse("LENS_ASSIST_TEST_UNSET_KEY_XYZ", 7usize), 7);
    }
}
