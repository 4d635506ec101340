//! Candidate generation boundary.
//!
//! The engine only needs "a prompt in, program text out". Providers live
//! behind [`CandidateGenerator`]:
//! - `chat`: hosted chat APIs (OpenAI-compatible and Anthropic messages)
//! - `fixtures`: replay of saved candidate files, deterministic by trial index
//! - `extract`: strips markdown fences from a response

pub mod chat;
pub mod extract;
pub mod fixtures;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{EngineError, Result};

pub use chat::ChatGenerator;
pub use extract::extract_code;
pub use fixtures::FixtureGenerator;

/// One request for a candidate.
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub trial_index: usize,
    pub prompt: &'a str,
}

/// Errors returned by a generator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GenerationError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("rate limited by provider")]
    RateLimited,

    #[error("provider returned {status}: {message}")]
    Provider { status: u16, message: String },

    #[error("provider returned no content")]
    EmptyResponse,

    #[error("fixture error: {0}")]
    Fixture(String),
}

impl GenerationError {
    /// Transient failures worth another request.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout { .. } | Self::RateLimited => true,
            Self::Provider { status, .. } => *status >= 500,
            Self::EmptyResponse | Self::Fixture(_) => false,
        }
    }
}

/// Produces candidate program text for a prompt.
#[async_trait]
pub trait CandidateGenerator: Send + Sync {
    async fn generate(
        &self,
        request: &GenerationRequest<'_>,
    ) -> std::result::Result<String, GenerationError>;

    /// Short label for logs.
    fn name(&self) -> &str;
}

/// Which generator backs a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    #[serde(rename = "openai", alias = "open_ai")]
    OpenAi,
    Fixtures,
}

impl Provider {
    pub fn default_model(&self) -> &'static str {
        match self {
            Self::Anthropic => "claude-3-5-haiku-latest",
            Self::OpenAi => "gpt-4o-mini",
            Self::Fixtures => "fixtures",
        }
    }

    pub fn default_api_key_env(&self) -> Option<&'static str> {
        match self {
            Self::Anthropic => Some("ANTHROPIC_API_KEY"),
            Self::OpenAi => Some("OPENAI_API_KEY"),
            Self::Fixtures => None,
        }
    }

    pub fn default_endpoint(&self) -> Option<&'static str> {
        match self {
            Self::Anthropic => Some("https://api.anthropic.com/v1/messages"),
            Self::OpenAi => Some("https://api.openai.com/v1/chat/completions"),
            Self::Fixtures => None,
        }
    }
}

/// `[generator]` section of the engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneratorConfig {
    pub provider: Provider,
    /// Provider default when unset.
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Env var holding the API key (provider default when unset).
    pub api_key_env: Option<String>,
    /// Override the provider endpoint (proxies, compatible servers).
    pub endpoint: Option<String>,
    pub request_timeout_ms: u64,
    /// Directory of saved candidates for the `fixtures` provider.
    pub candidates_dir: Option<PathBuf>,
    /// Retries after the first failed request (0 = one request only).
    pub max_retries: u32,
    pub backoff_base_ms: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            provider: Provider::Anthropic,
            model: None,
            temperature: 1.0,
            max_tokens: 1_000,
            api_key_env: None,
            endpoint: None,
            request_timeout_ms: 60_000,
            candidates_dir: None,
            max_retries: 2,
            backoff_base_ms: 500,
        }
    }
}

impl GeneratorConfig {
    pub fn model(&self) -> &str {
        self.model
            .as_deref()
            .unwrap_or_else(|| self.provider.default_model())
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_ms == 0 {
            return Err(EngineError::config(
                "generator.request_timeout_ms must be greater than zero",
            ));
        }
        if self.max_tokens == 0 {
            return Err(EngineError::config(
                "generator.max_tokens must be greater than zero",
            ));
        }
        if self.provider == Provider::Fixtures && self.candidates_dir.is_none() {
            return Err(EngineError::config(
                "generator.candidates_dir is required for the fixtures provider",
            ));
        }
        Ok(())
    }

    /// Build the configured generator.
    pub fn build(&self) -> Result<Arc<dyn CandidateGenerator>> {
        self.validate()?;
        match self.provider {
            Provider::Fixtures => {
                let dir = self.candidates_dir.as_ref().ok_or_else(|| {
                    EngineError::config("generator.candidates_dir is required for fixtures")
                })?;
                Ok(Arc::new(FixtureGenerator::from_dir(dir)?))
            }
            Provider::Anthropic | Provider::OpenAi => Ok(Arc::new(ChatGenerator::from_config(self)?)),
        }
    }
}
