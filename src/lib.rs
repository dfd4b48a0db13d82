//! Lens Assist: conversation orchestration core.

pub mod agent;
pub mod config;
pub mod conversation;
pub mod error;
pub mod llm;
pub mod parser;
pub mod persona;
pub mod sandbox;
pub mod store;
pub mod tools;
