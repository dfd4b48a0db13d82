//! Error types for Lens Assist.

use std::time::Duration;

/// Top-level error type for the orchestration core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Tool error: {0}")]
    Tool(#[from] crate::tools::ToolError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Persona error: {0}")]
    Persona(#[from] PersonaError),

    #[error("Agent loop error: {0}")]
    Loop(String),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for DatabaseError {
    fn from(e: serde_json::Error) -> Self {
        DatabaseError::Serialization(e.to_string())
    }
}

/// Errors raised by the model-streaming collaborator.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Model {model} request failed: {reason}")]
    RequestFailed { model: String, reason: String },

    #[error("Invalid response from {model}: {reason}")]
    InvalidResponse { model: String, reason: String },

    #[error("Model stream cancelled")]
    Cancelled,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Sandbox execution errors.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Failed to start sandbox process: {0}")]
    Spawn(String),

    #[error("Sandbox execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("Sandbox protocol error: {0}")]
    Protocol(String),

    #[error("Sandbox path not found: {0}")]
    PathNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persona registry and package errors.
#[derive(Debug, thiserror::Error)]
pub enum PersonaError {
    #[error("Persona {id} not found")]
    NotFound { id: String },

    #[error("Invalid persona package: {0}")]
    InvalidPackage(String),

    #[error("Persona {id} is built in and cannot be removed")]
    BuiltIn { id: String },

    #[error("Failed to load persona {id}: {reason}")]
    LoadFailed { id: String, reason: String },
}

/// Result type alias for the orchestration core.
pub type Result<T> = std::result::Result<T, Error>;
