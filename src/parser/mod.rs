//! Segmentation of turns into renderable blocks, and executable fence detection.

pub mod fence;
pub mod segment;

pub use fence::{EXEC_MARKER, extract_executable_blocks};
pub use segment::{AttachmentRef, Block, BlockStatus, segment};

/// Prefix of the user-role content carrying embedded-code output back to the model.
pub const SYSTEM_OUTPUT_PREFIX: &str = "[System Output from python:run]";

/// Prefix of the output line listing files a code run produced.
pub const GENERATED_FILES_PREFIX: &str = "[System] Generated files: ";
