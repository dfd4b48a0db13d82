//! Tool abstraction for agent capabilities.

pub mod builtin;
pub mod registry;
pub mod tool;

pub use registry::{ToolRegistry, unknown_tool_message};
pub use tool::*;
