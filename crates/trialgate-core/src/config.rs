//! Engine configuration loaded from TOML.
//!
//! Every section is optional and defaulted:
//!
//! ```toml
//! [task]       # TaskSpec: entrypoint, dataset, thresholds, capabilities
//! [dataset]    # data_dir for downloads
//! [prompt]     # template file
//! [executor]   # interpreter, timeout
//! [generator]  # provider, model, retries
//! [batch]      # trials, concurrency
//! [tuner]      # target interval, steps, budget
//! [logs]       # log directory
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::batch::ConcurrencyPolicy;
use crate::domain::{EngineError, Result, TaskSpec};
use crate::executor::ExecutorConfig;
use crate::generation::GeneratorConfig;
use crate::grader::Rubric;
use crate::prompt::PromptSpec;
use crate::trial::RetryPolicy;
use crate::tuner::TunerConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Where downloaded datasets are stored.
    pub data_dir: PathBuf,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("task/data"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    /// Template file; the built-in template when unset.
    pub file: Option<PathBuf>,
}

impl PromptConfig {
    pub fn load(&self) -> Result<PromptSpec> {
        match &self.file {
            Some(path) => PromptSpec::from_file(path),
            None => Ok(PromptSpec::default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub trials: usize,
    pub max_in_flight: usize,
    /// Run trials one at a time regardless of `max_in_flight`.
    pub sequential: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            trials: 10,
            max_in_flight: 4,
            sequential: false,
        }
    }
}

impl BatchConfig {
    pub fn policy(&self) -> ConcurrencyPolicy {
        if self.sequential {
            ConcurrencyPolicy::Sequential
        } else {
            ConcurrencyPolicy::BoundedParallel {
                max_in_flight: self.max_in_flight,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub dir: PathBuf,
    /// Skip the summary and trial logs entirely.
    pub disabled: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            disabled: false,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub task: TaskSpec,
    pub dataset: DatasetConfig,
    pub prompt: PromptConfig,
    pub executor: ExecutorConfig,
    pub generator: GeneratorConfig,
    pub batch: BatchConfig,
    pub tuner: TunerConfig,
    pub logs: LogConfig,
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| EngineError::config(format!("invalid config: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::config(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.generator.max_retries,
            backoff_base_ms: self.generator.backoff_base_ms,
        }
    }

    /// Reject anything that would make a batch meaningless. Runs before any
    /// trial.
    pub fn validate(&self) -> Result<()> {
        self.task.validate()?;
        Rubric::from_task(&self.task)?;
        self.executor
            .validate()
            .map_err(|e| EngineError::config(e.to_string()))?;
        self.generator.validate()?;
        if self.batch.trials == 0 {
            return Err(EngineError::config("batch.trials must be greater than zero"));
        }
        if self.batch.policy().max_in_flight() == 0 {
            return Err(EngineError::config(
                "batch.max_in_flight must be greater than zero",
            ));
        }
        self.tuner.validate()?;
        Ok(())
    }
}
