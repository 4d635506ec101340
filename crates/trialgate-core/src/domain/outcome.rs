//! Executor outcomes: what happened when a candidate was run.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Classification of an error raised by a candidate.
///
/// Kept fine-grained enough for failure-mode statistics across a batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Source could not be parsed or imported.
    Load,
    DivisionByZero,
    KeyNotFound,
    Type,
    Value,
    Index,
    Attribute,
    Name,
    Import,
    Memory,
    /// Interpreter exited without reporting a result.
    Crash,
    Other(String),
}

impl ErrorKind {
    /// Map an interpreter exception class name onto a kind.
    pub fn from_exception_name(name: &str) -> Self {
        match name {
            "ZeroDivisionError" | "FloatingPointError" => Self::DivisionByZero,
            "KeyError" => Self::KeyNotFound,
            "TypeError" => Self::Type,
            "ValueError" => Self::Value,
            "IndexError" => Self::Index,
            "AttributeError" => Self::Attribute,
            "NameError" | "UnboundLocalError" => Self::Name,
            "ImportError" | "ModuleNotFoundError" => Self::Import,
            "MemoryError" => Self::Memory,
            "SyntaxError" | "IndentationError" | "TabError" => Self::Load,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::Load => "load".to_string(),
            Self::DivisionByZero => "division_by_zero".to_string(),
            Self::KeyNotFound => "key_not_found".to_string(),
            Self::Type => "type".to_string(),
            Self::Value => "value".to_string(),
            Self::Index => "index".to_string(),
            Self::Attribute => "attribute".to_string(),
            Self::Name => "name".to_string(),
            Self::Import => "import".to_string(),
            Self::Memory => "memory".to_string(),
            Self::Crash => "crash".to_string(),
            Self::Other(name) => format!("other:{name}"),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Result of attempting to run one candidate. Produced once per trial and
/// consumed once by the grader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutorOutcome {
    Returned {
        value: serde_json::Value,
    },
    RaisedError {
        kind: ErrorKind,
        message: String,
    },
    TimedOut {
        limit_ms: u64,
    },
    EntrypointMissing {
        entrypoint: String,
    },
    SignatureMismatch {
        expected: usize,
        actual: usize,
    },
}

impl ExecutorOutcome {
    pub fn is_returned(&self) -> bool {
        matches!(self, Self::Returned { .. })
    }

    /// Compact, value-free description for trial records.
    pub fn summary(&self) -> OutcomeSummary {
        match self {
            Self::Returned { .. } => OutcomeSummary {
                status: "returned".to_string(),
                error_kind: None,
                message: None,
            },
            Self::RaisedError { kind, message } => OutcomeSummary {
                status: "raised_error".to_string(),
                error_kind: Some(kind.clone()),
                message: Some(message.clone()),
            },
            Self::TimedOut { limit_ms } => OutcomeSummary {
                status: "timed_out".to_string(),
                error_kind: None,
                message: Some(format!("exceeded {limit_ms}ms")),
            },
            Self::EntrypointMissing { entrypoint } => OutcomeSummary {
                status: "entrypoint_missing".to_string(),
                error_kind: None,
                message: Some(format!("function '{entrypoint}' not found")),
            },
            Self::SignatureMismatch { expected, actual } => OutcomeSummary {
                status: "signature_mismatch".to_string(),
                error_kind: None,
                message: Some(format!(
                    "expected {expected} positional parameter(s), found {actual}"
                )),
            },
        }
    }
}

/// What a trial record keeps of an [`ExecutorOutcome`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeSummary {
    /// `returned`, `raised_error`, `timed_out`, `entrypoint_missing`,
    /// `signature_mismatch`, `generation_failed` or `internal_error`.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl OutcomeSummary {
    pub fn generation_failed(message: impl Into<String>) -> Self {
        Self {
            status: "generation_failed".to_string(),
            error_kind: None,
            message: Some(message.into()),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self {
            status: "internal_error".to_string(),
            error_kind: None,
            message: Some(message.into()),
        }
    }
}
