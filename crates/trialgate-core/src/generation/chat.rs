//! Hosted chat API generator (Anthropic messages or OpenAI-compatible chat).

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::domain::{EngineError, Result};

use super::{CandidateGenerator, GenerationError, GenerationRequest, GeneratorConfig, Provider};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_ERROR_BODY: usize = 512;

/// Single-turn chat completion client.
pub struct ChatGenerator {
    provider: Provider,
    model: String,
    endpoint: String,
    api_key: String,
    temperature: f32,
    max_tokens: u32,
    timeout_ms: u64,
    client: reqwest::Client,
}

impl std::fmt::Debug for ChatGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatGenerator")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl ChatGenerator {
    /// Build from config, reading the API key from the configured env var.
    pub fn from_config(config: &GeneratorConfig) -> Result<Self> {
        let env_var = config
            .api_key_env
            .as_deref()
            .or_else(|| config.provider.default_api_key_env())
            .ok_or_else(|| EngineError::config("generator.api_key_env is required"))?;
        let api_key = std::env::var(env_var).map_err(|_| {
            EngineError::config(format!("environment variable {env_var} is not set"))
        })?;
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &GeneratorConfig, api_key: impl Into<String>) -> Result<Self> {
        let endpoint = config
            .endpoint
            .as_deref()
            .or_else(|| config.provider.default_endpoint())
            .ok_or_else(|| {
                EngineError::config(format!(
                    "provider {:?} has no chat endpoint",
                    config.provider
                ))
            })?
            .to_string();

        let client = reqwest::Client::builder()
            .user_agent(concat!("trialgate/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| EngineError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            provider: config.provider,
            model: config.model().to_string(),
            endpoint,
            api_key: api_key.into(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout_ms: config.request_timeout_ms,
            client,
        })
    }

    fn request_body(&self, prompt: &str) -> Value {
        json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "messages": [{ "role": "user", "content": prompt }],
        })
    }

    fn classify_transport(&self, err: reqwest::Error) -> GenerationError {
        if err.is_timeout() {
            GenerationError::Timeout {
                after_ms: self.timeout_ms,
            }
        } else {
            GenerationError::Transport(err.to_string())
        }
    }
}

/// Text content of a provider response, if any.
fn response_text(provider: Provider, body: &Value) -> Option<String> {
    match provider {
        Provider::Anthropic => {
            let blocks = body.get("content")?.as_array()?;
            let text: String = blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n");
            Some(text)
        }
        Provider::OpenAi => body
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string),
        Provider::Fixtures => None,
    }
}

#[async_trait]
impl CandidateGenerator for ChatGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest<'_>,
    ) -> std::result::Result<String, GenerationError> {
        let body = self.request_body(request.prompt);
        let mut builder = self.client.post(&self.endpoint).json(&body);
        builder = match self.provider {
            Provider::Anthropic => builder
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION),
            _ => builder.bearer_auth(&self.api_key),
        };

        debug!(
            trial = request.trial_index,
            model = %self.model,
            "requesting candidate"
        );
        let response = builder
            .send()
            .await
            .map_err(|e| self.classify_transport(e))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(GenerationError::RateLimited);
        }
        if !status.is_success() {
            let mut message = response.text().await.unwrap_or_default();
            if message.len() > MAX_ERROR_BODY {
                let cut = (0..=MAX_ERROR_BODY)
                    .rev()
                    .find(|i| message.is_char_boundary(*i))
                    .unwrap_or(0);
                message.truncate(cut);
            }
            return Err(GenerationError::Provider {
                status: status.as_u16(),
                message,
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| self.classify_transport(e))?;
        response_text(self.provider, &body)
            .filter(|text| !text.trim().is_empty())
            .ok_or(GenerationError::EmptyResponse)
    }

    fn name(&self) -> &str {
        match self.provider {
            Provider::Anthropic => "anthropic",
            Provider::OpenAi => "openai",
            Provider::Fixtures => "fixtures",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anthropic_text_blocks_joined() {
        let body = json!({
            "content": [
                {"type": "text", "text": "```python"},
                {"type": "tool_use", "name": "x"},
                {"type": "text", "text": "x = 1\n```"}
            ]
        });
        assert_eq!(
            response_text(Provider::Anthropic, &body).as_deref(),
            Some("```python\nx = 1\n```")
        );
    }

    #[test]
    fn test_openai_content() {
        let body = json!({"choices": [{"message": {"role": "assistant", "content": "def f(p): pass"}}]});
        assert_eq!(
            response_text(Provider::OpenAi, &body).as_deref(),
            Some("def f(p): pass")
        );
        assert!(response_text(Provider::OpenAi, &json!({"choices": []})).is_none());
    }

    #[test]
    fn test_request_body_shape() {
        let cfg = GeneratorConfig {
            provider: Provider::OpenAi,
            model: Some("gpt-test".into()),
            ..Default::default()
        };
        let generator = ChatGenerator::with_api_key(&cfg, "sk-test").unwrap();
        let body = generator.request_body("write code");
        assert_eq!(body["model"], "gpt-test");
        assert_eq!(body["max_tokens"], 1_000);
        assert_eq!(body["messages"][0]["content"], "write code");
        assert_eq!(generator.name(), "openai");
    }

    #[test]
    fn test_debug_hides_key() {
        let generator = ChatGenerator::with_api_key(&GeneratorConfig::default(), "secret-key").unwrap();
        assert!(!format!("{:?}", generator).contains("secret-key"));
    }

    #[test]
    fn test_fixtures_provider_has_no_endpoint() {
        let cfg = GeneratorConfig {
            provider: Provider::Fixtures,
            ..Default::default()
        };
        assert!(ChatGenerator::with_api_key(&cfg, "k").is_err());
    }
}
