//! Engine-level error taxonomy.

/// Errors that can escape the engine to its caller.
///
/// Everything that happens inside a single trial is converted into a failing
/// [`TrialRecord`](crate::domain::TrialRecord) instead; only configuration and
/// persistence problems surface here.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Shorthand for a [`EngineError::Configuration`] error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether the error is fatal before any trial runs.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::Dataset(_))
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
