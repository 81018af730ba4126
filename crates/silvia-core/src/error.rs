//! Error types for Silvia

use thiserror::Error;

/// Result type alias using Silvia's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Silvia error types with helpful messages
#[derive(Error, Debug)]
pub enum Error {
    #[error("Entity '{0}' not found. Run `silvia search {0}` to look for it.")]
    EntityNotFound(String),

    #[error("Entity '{0}' already exists. Use `silvia show {0}` to inspect it.")]
    EntityExists(String),

    #[error("Cannot delete '{0}': referenced by {1} other entities. Unlink them first.")]
    Referenced(String, usize),

    #[error("Invalid entity: {0}")]
    Validation(String),

    #[error("Invalid entity type: {0}")]
    InvalidType(String),

    #[error("Failed to parse entity document at {path}: {message}")]
    Format { path: String, message: String },

    #[error("Network error: {0}. Check your internet connection.")]
    Network(#[from] reqwest::Error),

    #[error("LLM error: {0}. Check that OPENROUTER_API_KEY is set.")]
    Llm(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error is worth retrying (transient network/LLM trouble)
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Llm(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_entity() {
        let err = Error::EntityNotFound("people/jane".into());
        assert!(err.to_string().contains("people/jane"));

        let err = Error::Referenced("concepts/x".into(), 3);
        assert!(err.to_string().contains("3 other entities"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::Llm("timeout".into()).is_transient());
        assert!(!Error::EntityExists("people/jane".into()).is_transient());
    }
}
