//! OpenAI-compatible chat-completions adapter.
//!
//! Also serves Deepseek, OpenRouter and Mistral, which speak the same wire
//! protocol against their own base URLs.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::config::{ModelParams, RunConfig, Task};
use crate::logging::{LogLevel, Logger};
use crate::results::Usage;

use super::{assemble_prompts, Provider, ProviderAnswer, ProviderError};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Chat-completions client bound to one endpoint.
pub struct OpenAiProvider {
    name: &'static str,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(name: &'static str, api_key: String, base_url: String) -> Self {
        Self {
            name,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn build_messages(
        &self,
        run: &RunConfig,
        task: &Task,
    ) -> Result<Vec<serde_json::Value>, ProviderError> {
        let parts = assemble_prompts(task);
        let mut messages = Vec::new();
        if let Some(system) = &parts.system {
            messages.push(json!({"role": "system", "content": system}));
        }

        if task.files.is_empty() {
            messages.push(json!({"role": "user", "content": parts.user}));
            return Ok(messages);
        }

        // Attachments ride along as data-URL image parts. Anything that is
        // not an image is a capability gap for this API.
        let mut content = vec![json!({"type": "text", "text": parts.user})];
        for file in &task.files {
            let resolved = file.content().await?;
            if !resolved.mime_type.starts_with("image/") {
                return Err(ProviderError::FileNotSupported(format!(
                    "{} does not accept '{}' attachments (file '{}', run '{}')",
                    self.name, resolved.mime_type, file.name, run.name
                )));
            }
            content.push(json!({
                "type": "image_url",
                "image_url": {
                    "url": format!("data:{};base64,{}", resolved.mime_type, resolved.base64)
                }
            }));
        }
        messages.push(json!({"role": "user", "content": content}));
        Ok(messages)
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        self.name
    }

    async fn run(
        &self,
        logger: &Logger,
        run: &RunConfig,
        task: &Task,
    ) -> Result<ProviderAnswer, ProviderError> {
        let messages = self.build_messages(run, task).await?;
        let mut body = json!({
            "model": &run.model,
            "messages": messages,
        });

        let (temperature, top_p, max_tokens, reasoning_effort) =
            request_knobs(run.model_params.as_ref());
        if let Some(t) = temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = top_p {
            body["top_p"] = json!(p);
        }
        if let Some(m) = max_tokens {
            body["max_tokens"] = json!(m);
        }
        if let Some(effort) = reasoning_effort {
            body["reasoning_effort"] = json!(effort);
        }

        if task.response_format.is_structured() {
            body["response_format"] = json!({"type": "json_object"});
        }

        logger.message(
            LogLevel::Debug,
            format!("{}: requesting model '{}'", self.name, run.model),
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|err| ProviderError::from_transport(self.name, err))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_http(self.name, status, &body));
        }

        #[derive(Deserialize)]
        struct Message {
            content: Option<String>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: Message,
        }
        #[derive(Deserialize)]
        struct ApiUsage {
            prompt_tokens: Option<i64>,
            completion_tokens: Option<i64>,
        }
        #[derive(Deserialize)]
        struct ApiResponse {
            choices: Vec<Choice>,
            usage: Option<ApiUsage>,
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::Other(anyhow::anyhow!(
                "{} returned an unreadable response: {}",
                self.name,
                err
            )))?;

        let text = api_response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| {
                ProviderError::Other(anyhow::anyhow!("{} returned no choices", self.name))
            })?;

        let usage = api_response
            .usage
            .map(|u| Usage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(ProviderAnswer { text, usage })
    }
}

/// Collapse the OpenAI-compatible parameter variants into one knob tuple
/// `(temperature, top_p, max_tokens, reasoning_effort)` so a single
/// extraction site serves all four endpoints.
fn request_knobs(
    params: Option<&ModelParams>,
) -> (Option<f64>, Option<f64>, Option<u32>, Option<String>) {
    match params {
        Some(ModelParams::Openai {
            temperature,
            top_p,
            max_tokens,
            reasoning_effort,
        }) => (
            *temperature,
            *top_p,
            *max_tokens,
            reasoning_effort.clone(),
        ),
        Some(
            ModelParams::Deepseek {
                temperature,
                max_tokens,
            }
            | ModelParams::Openrouter {
                temperature,
                max_tokens,
            }
            | ModelParams::Mistral {
                temperature,
                max_tokens,
            },
        ) => (*temperature, None, *max_tokens, None),
        _ => (None, None, None, None),
    }
}
