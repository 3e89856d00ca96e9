//! Google Gemini generateContent adapter.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::config::{ModelParams, RunConfig, Task};
use crate::logging::{LogLevel, Logger};
use crate::results::Usage;

use super::{assemble_prompts, Provider, ProviderAnswer, ProviderError};

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

pub struct GoogleProvider {
    api_key: String,
    client: reqwest::Client,
}

impl GoogleProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Provider for GoogleProvider {
    fn name(&self) -> &str {
        "google"
    }

    async fn run(
        &self,
        logger: &Logger,
        run: &RunConfig,
        task: &Task,
    ) -> Result<ProviderAnswer, ProviderError> {
        let parts = assemble_prompts(task);

        let mut user_parts = vec![json!({"text": parts.user})];
        for file in &task.files {
            let resolved = file.content().await?;
            user_parts.push(json!({
                "inline_data": {
                    "mime_type": resolved.mime_type,
                    "data": resolved.base64,
                }
            }));
        }

        let mut generation_config = serde_json::Map::new();
        if let Some(ModelParams::Google {
            temperature,
            top_k,
            max_output_tokens,
        }) = run.model_params.as_ref()
        {
            if let Some(t) = temperature {
                generation_config.insert("temperature".to_string(), json!(t));
            }
            if let Some(k) = top_k {
                generation_config.insert("topK".to_string(), json!(k));
            }
            if let Some(m) = max_output_tokens {
                generation_config.insert("maxOutputTokens".to_string(), json!(m));
            }
        }
        if task.response_format.is_structured() {
            generation_config.insert("responseMimeType".to_string(), json!("application/json"));
        }

        let mut body = json!({
            "contents": [{"role": "user", "parts": user_parts}],
        });
        if let Some(system) = &parts.system {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }
        if !generation_config.is_empty() {
            body["generationConfig"] = serde_json::Value::Object(generation_config);
        }

        logger.message(
            LogLevel::Debug,
            format!("google: requesting model '{}'", run.model),
        );

        let response = self
            .client
            .post(format!(
                "{}/{}:generateContent?key={}",
                BASE_URL, run.model, self.api_key
            ))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|err| ProviderError::from_transport("google", err))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_http("google", status, &body));
        }

        #[derive(Deserialize)]
        struct Part {
            text: Option<String>,
        }
        #[derive(Deserialize)]
        struct Content {
            parts: Option<Vec<Part>>,
        }
        #[derive(Deserialize)]
        struct Candidate {
            content: Option<Content>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct UsageMetadata {
            prompt_token_count: Option<i64>,
            candidates_token_count: Option<i64>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ApiResponse {
            candidates: Option<Vec<Candidate>>,
            usage_metadata: Option<UsageMetadata>,
        }

        let api_response: ApiResponse = response.json().await.map_err(|err| {
            ProviderError::Other(anyhow::anyhow!(
                "google returned an unreadable response: {}",
                err
            ))
        })?;

        let text: String = api_response
            .candidates
            .unwrap_or_default()
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .and_then(|c| c.parts)
            .map(|parts| {
                parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        if text.is_empty() {
            return Err(ProviderError::Other(anyhow::anyhow!(
                "google returned no candidates"
            )));
        }

        let usage = api_response
            .usage_metadata
            .map(|u| Usage {
                input_tokens: u.prompt_token_count,
                output_tokens: u.candidates_token_count,
            })
            .unwrap_or_default();

        Ok(ProviderAnswer { text, usage })
    }
}
