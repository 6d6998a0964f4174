//! ============================================================================
//! Error Types - Failure taxonomy shared by every memchat component
//! ============================================================================

/// Error types for the chat backend
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MemchatError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Embedding dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Empty input")]
    EmptyInput,
}

impl MemchatError {
    /// Wrap a backend failure as `StorageUnavailable` with some context
    pub fn storage(context: &str, err: impl std::fmt::Display) -> Self {
        MemchatError::StorageUnavailable(format!("{}: {}", context, err))
    }

    /// Whether the error points at a deployment fault rather than a transient one
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MemchatError::Configuration(_) | MemchatError::DimensionMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, MemchatError>;
