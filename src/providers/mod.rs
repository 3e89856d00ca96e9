//! Provider abstraction and HTTP adapters.
//!
//! A [`Provider`] runs one task against one model and returns the raw answer
//! text plus usage. Adapters classify their failures: transient conditions
//! (rate limits, 5xx, network) are marked retryable for the retry harness,
//! capability gaps are marked not-supported and never retried. The harness
//! itself never re-classifies a provider error.

pub mod anthropic;
pub mod fake;
pub mod google;
pub mod openai;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{ClientSettings, FileError, ProviderConfig, ProviderName, RunConfig, Task};
use crate::logging::Logger;
use crate::results::Usage;

pub use anthropic::AnthropicProvider;
pub use google::GoogleProvider;
pub use openai::OpenAiProvider;

/// Classified provider failure.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Transient condition; the retry harness may try again.
    #[error("transient provider failure: {0}")]
    Retryable(#[source] anyhow::Error),

    /// The provider cannot perform the requested operation at all.
    #[error("feature not supported: {0}")]
    FeatureNotSupported(String),

    /// The provider cannot accept an attached file of this type.
    #[error("file not supported: {0}")]
    FileNotSupported(String),

    /// A task file could not be resolved.
    #[error(transparent)]
    File(#[from] FileError),

    /// The batch was cancelled while the call was in flight.
    #[error("operation cancelled")]
    Cancelled,

    /// Anything else; fatal for this task.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Retryable(_))
    }

    pub fn is_not_supported(&self) -> bool {
        matches!(
            self,
            ProviderError::FeatureNotSupported(_) | ProviderError::FileNotSupported(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProviderError::Cancelled)
    }

    /// Classify an HTTP error response: 429 and 5xx are transient, anything
    /// else is fatal.
    pub fn from_http(provider: &str, status: reqwest::StatusCode, body: &str) -> Self {
        let err = anyhow::anyhow!("{} API error {}: {}", provider, status, body);
        if status.as_u16() == 429 || status.is_server_error() {
            ProviderError::Retryable(err)
        } else {
            ProviderError::Other(err)
        }
    }

    /// Classify a transport-level failure. Timeouts and connection problems
    /// are transient; request-construction bugs are not.
    pub fn from_transport(provider: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            ProviderError::Retryable(anyhow::anyhow!("{} request failed: {}", provider, err))
        } else if err.is_builder() {
            ProviderError::Other(anyhow::anyhow!("{} request invalid: {}", provider, err))
        } else {
            ProviderError::Retryable(anyhow::anyhow!("{} transport failure: {}", provider, err))
        }
    }
}

/// Raw outcome of one provider call, before response-format interpretation.
#[derive(Debug, Clone)]
pub struct ProviderAnswer {
    pub text: String,
    pub usage: Usage,
}

/// Final prompt strings sent to a model for one task.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptParts {
    pub system: Option<String>,
    pub user: String,
}

/// Assemble the final prompts for a task. The response-format instruction is
/// appended to the user prompt: plain-text instructions verbatim, schemas as
/// an explicit JSON requirement.
pub fn assemble_prompts(task: &Task) -> PromptParts {
    let user = match &task.response_format {
        crate::config::ResponseFormat::Text(instruction) => {
            format!("{}\n\nProvide the answer as: {}", task.prompt, instruction)
        }
        crate::config::ResponseFormat::Schema(schema) => {
            format!(
                "{}\n\nRespond with a single JSON value conforming to this schema, with no surrounding prose:\n{}",
                task.prompt,
                serde_json::Value::Object(schema.clone())
            )
        }
    };
    PromptParts {
        system: task.system_prompt.clone(),
        user,
    }
}

/// A model endpoint the harness can run tasks against.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Display name used in results, logs and rate-limiter keys.
    fn name(&self) -> &str;

    /// Hard cap on concurrent in-flight requests; `None` means unbounded.
    fn max_concurrent_requests(&self) -> Option<usize> {
        None
    }

    /// Run one task against one run configuration.
    async fn run(
        &self,
        logger: &Logger,
        run: &RunConfig,
        task: &Task,
    ) -> Result<ProviderAnswer, ProviderError>;

    /// Release any resources. Called once by the owner.
    async fn close(&self) {}
}

/// Instantiate the adapter for a provider block. Deepseek, OpenRouter and
/// Mistral ride the OpenAI-compatible adapter against their own endpoints.
pub fn create_provider(config: &ProviderConfig) -> Arc<dyn Provider> {
    let api_key = config.client.api_key().to_string();
    match config.name {
        ProviderName::Openai => {
            let base_url = match &config.client {
                ClientSettings::Openai { base_url, .. } => base_url.clone(),
                _ => None,
            };
            Arc::new(OpenAiProvider::new(
                "openai",
                api_key,
                base_url.unwrap_or_else(|| openai::OPENAI_BASE_URL.to_string()),
            ))
        }
        ProviderName::Deepseek => Arc::new(OpenAiProvider::new(
            "deepseek",
            api_key,
            "https://api.deepseek.com/v1".to_string(),
        )),
        ProviderName::Openrouter => Arc::new(OpenAiProvider::new(
            "openrouter",
            api_key,
            "https://openrouter.ai/api/v1".to_string(),
        )),
        ProviderName::Mistral => Arc::new(OpenAiProvider::new(
            "mistral",
            api_key,
            "https://api.mistral.ai/v1".to_string(),
        )),
        ProviderName::Anthropic => {
            let timeout = match &config.client {
                ClientSettings::Anthropic {
                    request_timeout_seconds,
                    ..
                } => *request_timeout_seconds,
                _ => None,
            };
            Arc::new(AnthropicProvider::new(api_key, timeout))
        }
        ProviderName::Google => Arc::new(GoogleProvider::new(api_key)),
    }
}
