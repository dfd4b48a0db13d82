//! Built-in tools: sandbox code execution and image generation.

pub mod image_gen;
pub mod python;

pub use image_gen::{DEFAULT_IMAGE_MODEL, GenerateImageTool, ImageGenerator, InlineImage};
pub use python::RunPythonTool;
