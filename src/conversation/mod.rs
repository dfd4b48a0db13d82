//! Conversation data model: threads, turns, contents, parts and workspace files.

pub mod files;
pub mod hydrate;
pub mod model;

pub use files::{
    Annotation, AnnotationKind, Artifact, DataBlock, FileCategory, FileEntry, FileKind,
    GeneratedFile, Layer, LayerKind, LayerStyle,
};
pub use hydrate::hydrate_turns;
pub use model::{
    Content, FunctionCall, FunctionResponse, GroundingChunk, GroundingMetadata, Part, Role, Thread,
    ThreadConfig, Turn, TurnKind, TurnStatus, derive_title,
};
