//! Silvia Core Library
//!
//! This crate provides the core functionality for Silvia, including:
//! - Knowledge graph engine (entity documents, link index, graph operations)
//! - Markdown document codec with YAML frontmatter
//! - Persistent priority queue of pending sources
//! - Processed-source tracking
//! - LLM integration (OpenRouter API)
//! - Configuration management

pub mod config;
pub mod error;
pub mod graph;
pub mod llm;
pub mod queue;
pub mod sources;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::graph::{Entity, EntityType, GraphOps, EntityStore};
}
