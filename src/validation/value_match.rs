//! Exact-value validator.
//!
//! Plain-text answers are compared after canonicalization under the task's
//! validation rules; structured answers are compared by deep equality after
//! recursive normalization of strings and numeric scalars. The validator is
//! stateless and never fails.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{ResponseFormat, ValidationRules, ValueSet};
use crate::executor::TaskResult;
use crate::logging::{LogLevel, Logger};
use crate::results::{FinalAnswer, Usage};

use super::{ValidationError, ValidationResult, Validator};

pub const VALUE_MATCH_TITLE: &str = "Response Assessment";

/// Apply only the whitespace-shaping part of the rules. Used by the answer
/// stage, which must not fold case: the recorded answer keeps the model's
/// casing while comparisons remain case-insensitive by default.
pub fn canonicalize_whitespace(rules: &ValidationRules, text: &str) -> String {
    if rules.is_ignore_whitespace() {
        text.chars().filter(|c| !c.is_whitespace()).collect()
    } else if rules.is_trim_lines() {
        text.split('\n')
            .map(|line| line.trim_end_matches('\r').trim())
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        text.trim().to_string()
    }
}

/// Canonicalize a string under the given rules. Idempotent for every rule
/// combination.
pub fn canonicalize_text(rules: &ValidationRules, text: &str) -> String {
    let spaced = canonicalize_whitespace(rules, text);
    if rules.is_case_sensitive() {
        spaced
    } else {
        spaced.to_lowercase()
    }
}

/// Normalize a numeric scalar to a canonical representation: whole floats
/// and fitting unsigned integers become signed 64-bit integers.
fn normalize_number(number: &serde_json::Number) -> serde_json::Value {
    if let Some(int) = number.as_i64() {
        return serde_json::Value::from(int);
    }
    if let Some(unsigned) = number.as_u64() {
        // Larger than i64::MAX; keep as u64.
        return serde_json::Value::from(unsigned);
    }
    if let Some(float) = number.as_f64() {
        if float.fract() == 0.0 && float >= i64::MIN as f64 && float <= i64::MAX as f64 {
            return serde_json::Value::from(float as i64);
        }
        return serde_json::Value::from(float);
    }
    serde_json::Value::Number(number.clone())
}

/// Recursively normalize a value: strings canonicalized under the rules,
/// numbers via [`normalize_number`], containers element-wise. Object key
/// order is irrelevant to the comparison.
pub fn normalize_value(rules: &ValidationRules, value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::String(text) => {
            serde_json::Value::String(canonicalize_text(rules, text))
        }
        serde_json::Value::Number(number) => normalize_number(number),
        serde_json::Value::Array(items) => serde_json::Value::Array(
            items.iter().map(|item| normalize_value(rules, item)).collect(),
        ),
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), normalize_value(rules, item)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Deep equality of two values after normalization.
pub fn values_equal(
    rules: &ValidationRules,
    expected: &serde_json::Value,
    actual: &serde_json::Value,
) -> bool {
    normalize_value(rules, expected) == normalize_value(rules, actual)
}

/// The stateless exact-match validator.
pub struct ValueMatchValidator;

impl ValueMatchValidator {
    fn matches(
        rules: &ValidationRules,
        format: &ResponseFormat,
        expected: &serde_json::Value,
        actual: &FinalAnswer,
    ) -> bool {
        match (format, actual) {
            (ResponseFormat::Text(_), FinalAnswer::Text(answer)) => expected
                .as_str()
                .map(|want| canonicalize_text(rules, want) == canonicalize_text(rules, answer))
                .unwrap_or(false),
            (_, FinalAnswer::Json(answer)) => values_equal(rules, expected, answer),
            (ResponseFormat::Schema(_), FinalAnswer::Text(answer)) => {
                // A structured task whose answer stage produced text should
                // not happen; fall back to comparing against a JSON string.
                values_equal(rules, expected, &serde_json::Value::String(answer.clone()))
            }
        }
    }
}

#[async_trait]
impl Validator for ValueMatchValidator {
    async fn is_correct(
        &self,
        _cancel: &CancellationToken,
        logger: &Logger,
        rules: &ValidationRules,
        expected: &ValueSet,
        actual: &TaskResult,
        _prompt: &str,
        format: &ResponseFormat,
    ) -> Result<ValidationResult, ValidationError> {
        let is_correct = expected
            .values()
            .iter()
            .any(|want| Self::matches(rules, format, want, &actual.final_answer));

        let explanation = if is_correct {
            "the answer matches an expected value".to_string()
        } else {
            format!(
                "the answer does not match any of the {} expected value(s)",
                expected.len()
            )
        };
        logger.message(
            LogLevel::Trace,
            format!("value match verdict: {} ({})", is_correct, explanation),
        );

        Ok(ValidationResult {
            is_correct,
            title: VALUE_MATCH_TITLE.to_string(),
            explanation,
            usage: Usage::default(),
        })
    }
}
