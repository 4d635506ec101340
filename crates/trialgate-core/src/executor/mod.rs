//! Submission executor: run one candidate against the entrypoint contract.
//!
//! - `harness`: envelope protocol and the embedded interpreter harness
//! - `interpreter`: process-per-trial executor with wall-clock timeout
//! - `error`: infrastructure failures (spawn, workspace)
//!
//! Candidate failures are never `Err`: they come back as
//! [`ExecutorOutcome`](crate::domain::ExecutorOutcome) values.

pub mod error;
pub mod harness;
pub mod interpreter;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::ExecutorOutcome;

pub use error::{ExecutorError, ExecutorResult};
pub use harness::{Envelope, PYTHON_HARNESS};
pub use interpreter::InterpreterExecutor;

/// Runs a candidate's entrypoint and reports what happened.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Load `source`, check `entrypoint` takes `arity` positional arguments,
    /// then invoke it with `arg`.
    async fn execute(
        &self,
        source: &str,
        entrypoint: &str,
        arity: usize,
        arg: &Value,
    ) -> ExecutorResult<ExecutorOutcome>;
}

/// Configuration for the interpreter-backed executor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Interpreter binary, resolved through `PATH`.
    pub interpreter: String,
    /// Extra arguments placed before the harness script.
    pub interpreter_args: Vec<String>,
    /// Wall-clock limit for one trial's process (milliseconds).
    pub timeout_ms: u64,
    /// How much of stderr to keep for crash reports.
    pub stderr_tail_bytes: usize,
    /// Alternate harness speaking the same envelope protocol.
    pub harness_script: Option<PathBuf>,
    /// Parent directory for per-trial scratch dirs (system temp when unset).
    pub scratch_root: Option<PathBuf>,
    /// Extra environment for the interpreter.
    pub env: BTreeMap<String, String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            interpreter_args: Vec::new(),
            timeout_ms: 120_000,
            stderr_tail_bytes: 2_048,
            harness_script: None,
            scratch_root: None,
            env: BTreeMap::new(),
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> ExecutorResult<()> {
        if self.interpreter.trim().is_empty() {
            return Err(ExecutorError::InvalidConfig(
                "interpreter must not be empty".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(ExecutorError::InvalidConfig(
                "timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
