//! Task executor.
//!
//! A [`TaskExecutor`] is bound at construction to one `(provider, run)` pair
//! and turns a task into an answer-stage result: it assembles the final
//! prompts, gates on the per-model rate limiter, invokes the provider inside
//! the retry harness, and interprets the raw answer according to the task's
//! response format. Validation is not performed here; that is the runner's
//! job.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{ResponseFormat, RunConfig, Task};
use crate::logging::{LogLevel, Logger};
use crate::providers::{assemble_prompts, PromptParts, Provider, ProviderError};
use crate::ratelimit::RateLimiter;
use crate::results::{FinalAnswer, Usage};
use crate::retry::retry;
use crate::validation::value_match::canonicalize_whitespace;

/// Answer-stage outcome for one `(run, task)` execution.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub trace_id: Uuid,
    /// Wall clock across rate-limit waits and retries.
    pub duration: Duration,
    /// The answer after response-format interpretation: canonicalized text
    /// or parsed, schema-conformant JSON.
    pub final_answer: FinalAnswer,
    /// The provider's answer exactly as received.
    pub raw_answer: String,
    pub usage: Usage,
    pub prompts: PromptParts,
}

/// Answer-stage failure, classified for the runner's `Kind` mapping.
#[derive(Debug, thiserror::Error)]
#[error("{title}: {message}")]
pub struct ExecuteError {
    pub trace_id: Uuid,
    pub duration: Duration,
    pub not_supported: bool,
    pub cancelled: bool,
    pub title: String,
    pub message: String,
    pub diagnostics: BTreeMap<String, String>,
    pub usage: Usage,
    pub prompts: PromptParts,
}

/// Executes tasks against one `(provider, run)` pair.
pub struct TaskExecutor {
    provider: Arc<dyn Provider>,
    run: RunConfig,
    limiter: Arc<RateLimiter>,
}

impl TaskExecutor {
    pub fn new(provider: Arc<dyn Provider>, run: RunConfig, limiter: Arc<RateLimiter>) -> Self {
        Self {
            provider,
            run,
            limiter,
        }
    }

    pub fn run_config(&self) -> &RunConfig {
        &self.run
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// Execute one task: acquire admission, call the provider under the
    /// run's retry policy, interpret the answer per the response format.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        logger: &Logger,
        task: &Task,
    ) -> Result<TaskResult, Box<ExecuteError>> {
        let trace_id = Uuid::new_v4();
        let started = Instant::now();
        let prompts = assemble_prompts(task);
        let logger = logger.with_context(&format!("{}", trace_id));

        logger.message(
            LogLevel::Trace,
            format!(
                "executing task '{}' (system: {:?}, user: {})",
                task.name, prompts.system, prompts.user
            ),
        );

        let guard = match self.limiter.acquire(cancel).await {
            Ok(guard) => guard,
            Err(_) => {
                return Err(self.cancelled_error(trace_id, started, &prompts));
            }
        };

        let policy = self.run.retry_policy();
        let outcome = retry(cancel, &policy, |call| {
            let logger = logger.clone();
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => Err(ProviderError::Cancelled),
                    result = self.provider.run(&logger, &self.run, task) => {
                        if call > 1 {
                            logger.message(
                                LogLevel::Debug,
                                format!("provider call #{} for task '{}'", call, task.name),
                            );
                        }
                        result
                    }
                }
            }
        })
        .await;
        drop(guard);

        let answer = match outcome {
            Ok(answer) => answer,
            Err(err) => {
                return Err(self.provider_error(trace_id, started, &prompts, err));
            }
        };

        let duration = started.elapsed();
        let final_answer = match &task.response_format {
            ResponseFormat::Text(_) => {
                FinalAnswer::Text(canonicalize_whitespace(&task.rules, &answer.text))
            }
            ResponseFormat::Schema(schema) => {
                match parse_structured(&answer.text, schema) {
                    Ok(value) => FinalAnswer::Json(value),
                    Err(failure) => {
                        return Err(Box::new(ExecuteError {
                            trace_id,
                            duration,
                            not_supported: false,
                            cancelled: false,
                            title: "Response Parsing Error".to_string(),
                            message: failure.message,
                            diagnostics: failure.diagnostics,
                            usage: answer.usage,
                            prompts,
                        }));
                    }
                }
            }
        };

        logger.message(
            LogLevel::Trace,
            format!("task '{}' answered: {}", task.name, final_answer),
        );

        Ok(TaskResult {
            trace_id,
            duration,
            final_answer,
            raw_answer: answer.text,
            usage: answer.usage,
            prompts,
        })
    }

    fn cancelled_error(
        &self,
        trace_id: Uuid,
        started: Instant,
        prompts: &PromptParts,
    ) -> Box<ExecuteError> {
        Box::new(ExecuteError {
            trace_id,
            duration: started.elapsed(),
            not_supported: false,
            cancelled: true,
            title: "Cancelled".to_string(),
            message: "the batch was cancelled before the provider call completed".to_string(),
            diagnostics: BTreeMap::from([(
                "cancelled".to_string(),
                "true".to_string(),
            )]),
            usage: Usage::default(),
            prompts: prompts.clone(),
        })
    }

    fn provider_error(
        &self,
        trace_id: Uuid,
        started: Instant,
        prompts: &PromptParts,
        err: ProviderError,
    ) -> Box<ExecuteError> {
        if err.is_cancelled() {
            return self.cancelled_error(trace_id, started, prompts);
        }
        let title = if err.is_not_supported() {
            "Not Supported"
        } else {
            "Provider Error"
        };
        let mut diagnostics = BTreeMap::new();
        diagnostics.insert("provider".to_string(), self.provider.name().to_string());
        diagnostics.insert("model".to_string(), self.run.model.clone());
        diagnostics.insert("error".to_string(), format!("{:?}", err));
        Box::new(ExecuteError {
            trace_id,
            duration: started.elapsed(),
            not_supported: err.is_not_supported(),
            cancelled: false,
            title: title.to_string(),
            message: err.to_string(),
            diagnostics,
            usage: Usage::default(),
            prompts: prompts.clone(),
        })
    }
}

/// Why a structured answer could not be accepted.
#[derive(Debug)]
pub struct StructuredParseFailure {
    pub message: String,
    pub diagnostics: BTreeMap<String, String>,
}

/// Interpret a raw answer as schema-conformant JSON. Models frequently wrap
/// JSON in markdown fences or prose; the raw text is tried first, then a
/// fence-stripped form, then the outermost JSON-looking slice.
pub fn parse_structured(
    raw: &str,
    schema: &serde_json::Map<String, serde_json::Value>,
) -> Result<serde_json::Value, StructuredParseFailure> {
    let candidates = repair_candidates(raw);
    let parsed = candidates
        .iter()
        .find_map(|candidate| serde_json::from_str::<serde_json::Value>(candidate).ok());

    let Some(value) = parsed else {
        let mut diagnostics = BTreeMap::new();
        diagnostics.insert("raw_response".to_string(), raw.to_string());
        diagnostics.insert(
            "recovery".to_string(),
            "stripped markdown fences and sliced the outermost JSON value; none parsed"
                .to_string(),
        );
        return Err(StructuredParseFailure {
            message: "response is not valid JSON".to_string(),
            diagnostics,
        });
    };

    let schema_value = serde_json::Value::Object(schema.clone());
    let validator = match jsonschema::validator_for(&schema_value) {
        Ok(validator) => validator,
        Err(err) => {
            let mut diagnostics = BTreeMap::new();
            diagnostics.insert("schema_error".to_string(), err.to_string());
            return Err(StructuredParseFailure {
                message: "response schema is not a valid JSON schema".to_string(),
                diagnostics,
            });
        }
    };

    if let Err(err) = validator.validate(&value) {
        let mut diagnostics = BTreeMap::new();
        diagnostics.insert("raw_response".to_string(), raw.to_string());
        diagnostics.insert("parsed_response".to_string(), value.to_string());
        diagnostics.insert("schema_violation".to_string(), err.to_string());
        return Err(StructuredParseFailure {
            message: format!("response does not conform to the response schema: {}", err),
            diagnostics,
        });
    }

    Ok(value)
}

/// Candidate strings to try parsing, most faithful first.
fn repair_candidates(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    let mut candidates = vec![trimmed.to_string()];

    let stripped = strip_markdown_fences(trimmed);
    if stripped != trimmed {
        candidates.push(stripped.to_string());
    }

    if let Some(sliced) = outermost_json_slice(trimmed) {
        if !candidates.iter().any(|c| c.as_str() == sliced) {
            candidates.push(sliced.to_string());
        }
    }
    candidates
}

/// Strip a ```json ... ``` (or bare ```) wrapper if present.
fn strip_markdown_fences(text: &str) -> &str {
    let inner = if text.contains("```json") {
        text.split("```json").nth(1).and_then(|s| s.split("```").next())
    } else if text.contains("```") {
        text.split("```").nth(1).and_then(|s| s.split("```").next())
    } else {
        None
    };
    inner.map(str::trim).unwrap_or(text)
}

/// The substring from the first `{`/`[` to the matching last `}`/`]`.
fn outermost_json_slice(text: &str) -> Option<&str> {
    let open_obj = text.find('{');
    let open_arr = text.find('[');
    let (open, close) = match (open_obj, open_arr) {
        (Some(o), Some(a)) if a < o => (a, ']'),
        (None, Some(a)) => (a, ']'),
        (Some(o), _) => (o, '}'),
        (None, None) => return None,
    };
    let end = text.rfind(close)?;
    if end < open {
        return None;
    }
    Some(&text[open..=end])
}
