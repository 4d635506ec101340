//! Error types for the executor module.
//!
//! These describe infrastructure failures (the harness could not be set up or
//! the interpreter could not be started). A candidate's own failures are
//! never errors; they are [`ExecutorOutcome`](crate::domain::ExecutorOutcome)s.

/// Errors produced by the executor layer.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("failed to prepare trial workspace: {0}")]
    Workspace(#[source] std::io::Error),

    #[error("failed to spawn interpreter '{interpreter}': {source}")]
    Spawn {
        interpreter: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting for interpreter: {0}")]
    Wait(#[source] std::io::Error),

    #[error("malformed result envelope: {0}")]
    Envelope(String),

    #[error("invalid executor configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for executor operations.
pub type ExecutorResult<T> = std::result::Result<T, ExecutorError>;
