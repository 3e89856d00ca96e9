//! Answer validation.
//!
//! The runner asks the [`ValidatorFactory`] for a validator per task: the
//! stateless value-match singleton by default, or a cached judge validator
//! when the task's rules select one. Judge validators are keyed by
//! `(name, variant)`, built once, and closed with the factory.

pub mod judge;
pub mod value_match;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, JudgeConfig, JudgeSelector, ResponseFormat, RunConfig,
    ValidationRules, ValueSet};
use crate::executor::{ExecuteError, TaskResult};
use crate::logging::Logger;
use crate::results::Usage;

pub use judge::JudgeValidator;
pub use value_match::ValueMatchValidator;

/// Outcome of one validation call.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    pub is_correct: bool,
    pub title: String,
    pub explanation: String,
    pub usage: Usage,
}

/// Validation-stage failure. A judge returning a well-formed "incorrect"
/// verdict is not an error; only infrastructure failures land here.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("judge validation supports only string expected values")]
    UnsupportedResponseFormat,

    #[error("judge execution failed: {0}")]
    Judge(#[source] Box<ExecuteError>),

    #[error("validation cancelled")]
    Cancelled,
}

impl ValidationError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ValidationError::Cancelled)
    }
}

/// Decides whether an answer satisfies a task's expected result.
#[async_trait]
pub trait Validator: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn is_correct(
        &self,
        cancel: &CancellationToken,
        logger: &Logger,
        rules: &ValidationRules,
        expected: &ValueSet,
        actual: &TaskResult,
        prompt: &str,
        format: &ResponseFormat,
    ) -> Result<ValidationResult, ValidationError>;

    /// Release owned resources. Called once by the factory.
    async fn close(&self) {}
}

/// Hands out validators and owns the judge cache.
pub struct ValidatorFactory {
    judges: Vec<JudgeConfig>,
    value_match: Arc<ValueMatchValidator>,
    cache: tokio::sync::Mutex<HashMap<(String, String), Arc<JudgeValidator>>>,
}

impl ValidatorFactory {
    pub fn new(judges: Vec<JudgeConfig>) -> Self {
        Self {
            judges,
            value_match: Arc::new(ValueMatchValidator),
            cache: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a selector to its judge config and run variant without
    /// constructing anything. An unset name falls back to the first
    /// configured judge; an unset variant falls back to the judge's first
    /// enabled run.
    fn resolve(&self, selector: &JudgeSelector) -> Result<(&JudgeConfig, RunConfig), ConfigError> {
        let judge = match selector.name.as_deref() {
            Some(name) => self
                .judges
                .iter()
                .find(|judge| judge.name == name)
                .ok_or_else(|| ConfigError::UnknownJudge(name.to_string()))?,
            None => self
                .judges
                .first()
                .ok_or_else(|| ConfigError::UnknownJudge(String::new()))?,
        };
        let variants = judge.enabled_variants();
        let run = match selector.variant.as_deref() {
            Some(variant) => variants
                .iter()
                .find(|run| run.name == variant)
                .copied()
                .ok_or_else(|| ConfigError::UnknownJudgeVariant {
                    name: judge.name.clone(),
                    variant: variant.to_string(),
                })?,
            None => variants
                .first()
                .copied()
                .ok_or_else(|| ConfigError::UnknownJudgeVariant {
                    name: judge.name.clone(),
                    variant: String::new(),
                })?,
        };
        Ok((judge, run.clone()))
    }

    /// Validate a selector without building its validator.
    pub fn assert_exists(&self, selector: &JudgeSelector) -> Result<(), ConfigError> {
        self.resolve(selector).map(|_| ())
    }

    /// The validator for a selector: the value-match singleton when the
    /// selector is absent or disabled, otherwise the cached judge validator
    /// for `(name, variant)`. Concurrent calls for the same key return the
    /// same instance.
    pub async fn validator(
        &self,
        selector: Option<&JudgeSelector>,
    ) -> Result<Arc<dyn Validator>, ConfigError> {
        let Some(selector) = selector.filter(|s| s.is_enabled()) else {
            return Ok(Arc::clone(&self.value_match) as Arc<dyn Validator>);
        };

        let key = selector.cache_key();
        let mut cache = self.cache.lock().await;
        if let Some(existing) = cache.get(&key) {
            return Ok(Arc::clone(existing) as Arc<dyn Validator>);
        }
        let (judge, run) = self.resolve(selector)?;
        let validator = Arc::new(JudgeValidator::new(judge, run));
        cache.insert(key, Arc::clone(&validator));
        Ok(validator as Arc<dyn Validator>)
    }

    /// Seed the cache with a pre-built judge validator for `(name, variant)`.
    /// Later lookups for that key return this instance instead of
    /// constructing one from configuration.
    pub fn preload(&mut self, name: &str, variant: &str, validator: Arc<JudgeValidator>) {
        self.cache
            .get_mut()
            .insert((name.to_string(), variant.to_string()), validator);
    }

    /// Close every cached judge validator, which closes their providers.
    pub async fn close(&self) {
        let mut cache = self.cache.lock().await;
        for (_, validator) in cache.drain() {
            validator.close().await;
        }
    }
}
