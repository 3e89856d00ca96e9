//! Anthropic messages-API adapter.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::config::{ModelParams, RunConfig, Task};
use crate::logging::{LogLevel, Logger};
use crate::results::Usage;

use super::{assemble_prompts, Provider, ProviderAnswer, ProviderError};

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

/// Token ceiling sent when the run does not configure one; the messages API
/// requires the field.
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(api_key: String, request_timeout_seconds: Option<u64>) -> Self {
        let mut builder = reqwest::Client::builder();
        if let Some(seconds) = request_timeout_seconds {
            builder = builder.timeout(Duration::from_secs(seconds));
        }
        Self {
            api_key,
            client: builder.build().unwrap_or_default(),
        }
    }

    async fn build_user_content(
        &self,
        run: &RunConfig,
        task: &Task,
        user_prompt: &str,
    ) -> Result<serde_json::Value, ProviderError> {
        if task.files.is_empty() {
            return Ok(json!(user_prompt));
        }
        let mut blocks = Vec::new();
        for file in &task.files {
            let resolved = file.content().await?;
            if !resolved.mime_type.starts_with("image/") {
                return Err(ProviderError::FileNotSupported(format!(
                    "anthropic does not accept '{}' attachments (file '{}', run '{}')",
                    resolved.mime_type, file.name, run.name
                )));
            }
            blocks.push(json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": resolved.mime_type,
                    "data": resolved.base64,
                }
            }));
        }
        blocks.push(json!({"type": "text", "text": user_prompt}));
        Ok(json!(blocks))
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn run(
        &self,
        logger: &Logger,
        run: &RunConfig,
        task: &Task,
    ) -> Result<ProviderAnswer, ProviderError> {
        let parts = assemble_prompts(task);
        let content = self.build_user_content(run, task, &parts.user).await?;

        let (temperature, max_tokens, thinking_budget) = match run.model_params.as_ref() {
            Some(ModelParams::Anthropic {
                temperature,
                max_tokens,
                thinking_budget_tokens,
            }) => (*temperature, *max_tokens, *thinking_budget_tokens),
            _ => (None, None, None),
        };

        let mut body = json!({
            "model": &run.model,
            "max_tokens": max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": [{"role": "user", "content": content}],
        });
        if let Some(system) = &parts.system {
            body["system"] = json!(system);
        }
        if let Some(t) = temperature {
            body["temperature"] = json!(t);
        }
        if let Some(budget) = thinking_budget {
            body["thinking"] = json!({"type": "enabled", "budget_tokens": budget});
        }

        logger.message(
            LogLevel::Debug,
            format!("anthropic: requesting model '{}'", run.model),
        );

        let response = self
            .client
            .post(API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|err| ProviderError::from_transport("anthropic", err))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_http("anthropic", status, &body));
        }

        #[derive(Deserialize)]
        struct ContentBlock {
            #[serde(rename = "type")]
            block_type: String,
            text: Option<String>,
        }
        #[derive(Deserialize)]
        struct ApiUsage {
            input_tokens: Option<i64>,
            output_tokens: Option<i64>,
        }
        #[derive(Deserialize)]
        struct ApiResponse {
            content: Vec<ContentBlock>,
            usage: Option<ApiUsage>,
        }

        let api_response: ApiResponse = response.json().await.map_err(|err| {
            ProviderError::Other(anyhow::anyhow!(
                "anthropic returned an unreadable response: {}",
                err
            ))
        })?;

        // Thinking blocks precede the answer; keep only text blocks.
        let text: String = api_response
            .content
            .iter()
            .filter(|block| block.block_type == "text")
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");
        if text.is_empty() {
            return Err(ProviderError::Other(anyhow::anyhow!(
                "anthropic returned no text content"
            )));
        }

        let usage = api_response
            .usage
            .map(|u| Usage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
            })
            .unwrap_or_default();

        Ok(ProviderAnswer { text, usage })
    }
}
