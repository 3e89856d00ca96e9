//! Judge validator.
//!
//! Wraps the answer in a grading prompt, runs it as a synthetic task on a
//! second model whose response is constrained to `{ "correct": boolean }`,
//! and extracts the verdict through the value-match validator. The judge's
//! executor owns its own rate limiter and retry policy, so a judge call
//! scheduled from inside the runner cannot deadlock against the outer
//! task's admission gate.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::config::{JudgeConfig, ResponseFormat, RunConfig, Task, ValidationRules, ValueSet};
use crate::executor::{TaskExecutor, TaskResult};
use crate::logging::{LogLevel, Logger};
use crate::providers::{create_provider, Provider};
use crate::ratelimit::RateLimiter;

use super::{ValidationError, ValidationResult, Validator, ValueMatchValidator};

pub const JUDGE_TITLE: &str = "Semantic Assessment";

/// Name of the synthetic grading task.
const ASSESSMENT_TASK_NAME: &str = "response assessment";

/// Response format the judge must answer in.
static JUDGE_RESPONSE_FORMAT: LazyLock<ResponseFormat> = LazyLock::new(|| {
    let schema = json!({
        "type": "object",
        "properties": {"correct": {"type": "boolean"}},
        "required": ["correct"],
        "additionalProperties": false
    });
    ResponseFormat::Schema(schema.as_object().cloned().unwrap_or_default())
});

/// The verdict that counts as "correct".
static JUDGE_EXPECTED_RESULT: LazyLock<ValueSet> =
    LazyLock::new(|| ValueSet::new(vec![json!({"correct": true})]));

const GRADING_TEMPLATE: &str = "\
You are grading another model's answer to a task.

## Original task
{{original_prompt}}

## Expected response format
{{expected_format}}

## Accepted answers
{{#each expected_answers}}- {{this}}
{{/each}}
## Candidate answer
{{actual_response}}

## Matching rules applied to literal comparison
{{rules}}

Decide whether the candidate answer is semantically equivalent to any \
accepted answer. Minor differences in casing, punctuation, phrasing or \
formatting do not matter; the meaning does.";

/// Validates answers by asking a second model for a semantic verdict.
pub struct JudgeValidator {
    judge_name: String,
    variant: String,
    provider: Arc<dyn Provider>,
    executor: TaskExecutor,
}

impl JudgeValidator {
    /// Build from a judge config, instantiating a fresh provider bound to
    /// the given run variant.
    pub fn new(judge: &JudgeConfig, run: RunConfig) -> Self {
        let provider = create_provider(&judge.provider);
        Self::with_provider(judge.name.clone(), provider, run)
    }

    /// Build around an existing provider. The judge gets a dedicated rate
    /// limiter keyed on its own model.
    pub fn with_provider(judge_name: String, provider: Arc<dyn Provider>, run: RunConfig) -> Self {
        let limiter = Arc::new(RateLimiter::new(
            run.max_requests_per_minute,
            provider.max_concurrent_requests(),
        ));
        let executor = TaskExecutor::new(Arc::clone(&provider), run.clone(), limiter);
        Self {
            judge_name,
            variant: run.name,
            provider,
            executor,
        }
    }

    pub fn judge_name(&self) -> &str {
        &self.judge_name
    }

    pub fn variant(&self) -> &str {
        &self.variant
    }

    fn grading_prompt(
        prompt: &str,
        format: &ResponseFormat,
        expected: &[String],
        actual: &str,
        rules: &ValidationRules,
    ) -> Result<String, handlebars::RenderError> {
        let mut registry = handlebars::Handlebars::new();
        registry.set_strict_mode(true);
        registry.render_template(
            GRADING_TEMPLATE,
            &json!({
                "original_prompt": prompt,
                "expected_format": format.describe(),
                "expected_answers": expected,
                "actual_response": actual,
                "rules": rules.describe(),
            }),
        )
    }
}

#[async_trait]
impl Validator for JudgeValidator {
    async fn is_correct(
        &self,
        cancel: &CancellationToken,
        logger: &Logger,
        rules: &ValidationRules,
        expected: &ValueSet,
        actual: &TaskResult,
        prompt: &str,
        format: &ResponseFormat,
    ) -> Result<ValidationResult, ValidationError> {
        let Some(expected_answers) = expected.as_string_set() else {
            return Err(ValidationError::UnsupportedResponseFormat);
        };

        let Some(answer_text) = actual.final_answer.as_text() else {
            return Ok(ValidationResult {
                is_correct: false,
                title: JUDGE_TITLE.to_string(),
                explanation: "the answer is not plain text, so it cannot be graded semantically"
                    .to_string(),
                usage: crate::results::Usage::default(),
            });
        };

        // Outer trim only: the judge absorbs case and internal whitespace
        // variance through the prompt, not through canonicalization.
        let candidate = answer_text.trim();

        let grading_prompt = Self::grading_prompt(prompt, format, &expected_answers, candidate, rules)
            .map_err(|err| {
                ValidationError::Judge(Box::new(crate::executor::ExecuteError {
                    trace_id: actual.trace_id,
                    duration: std::time::Duration::ZERO,
                    not_supported: false,
                    cancelled: false,
                    title: "Judge Prompt Error".to_string(),
                    message: err.to_string(),
                    diagnostics: Default::default(),
                    usage: crate::results::Usage::default(),
                    prompts: actual.prompts.clone(),
                }))
            })?;

        let synthetic = Task {
            name: ASSESSMENT_TASK_NAME.to_string(),
            prompt: grading_prompt,
            system_prompt: None,
            response_format: JUDGE_RESPONSE_FORMAT.clone(),
            expected_result: JUDGE_EXPECTED_RESULT.clone(),
            files: Vec::new(),
            rules: ValidationRules::default(),
        };

        let logger = logger.with_context(&format!("judge:{}", self.judge_name));
        logger.message(
            LogLevel::Debug,
            format!(
                "grading task answer via judge '{}' variant '{}'",
                self.judge_name, self.variant
            ),
        );

        let verdict = self
            .executor
            .execute(cancel, &logger, &synthetic)
            .await
            .map_err(|err| {
                if err.cancelled {
                    ValidationError::Cancelled
                } else {
                    ValidationError::Judge(err)
                }
            })?;

        let inner = ValueMatchValidator
            .is_correct(
                cancel,
                &logger,
                &ValidationRules::default(),
                &JUDGE_EXPECTED_RESULT,
                &verdict,
                "",
                &JUDGE_RESPONSE_FORMAT,
            )
            .await?;

        Ok(ValidationResult {
            is_correct: inner.is_correct,
            title: JUDGE_TITLE.to_string(),
            explanation: format!(
                "judge '{}' verdict: {}",
                self.judge_name, verdict.raw_answer.trim()
            ),
            usage: verdict.usage,
        })
    }

    async fn close(&self) {
        self.provider.close().await;
    }
}
