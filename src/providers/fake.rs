//! Scripted in-process provider for tests and dry runs.
//!
//! Responses are played back from a script; once the script is exhausted the
//! default response (if any) repeats. No network is involved, so suites can
//! pin exact call counts and outcome classifications.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{RunConfig, Task};
use crate::logging::Logger;
use crate::results::Usage;

use super::{Provider, ProviderAnswer, ProviderError};

/// One scripted provider outcome.
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Return this answer text.
    Answer(String),
    /// Return this answer text after a delay.
    AnswerAfter(Duration, String),
    /// Fail with a transient, retryable error.
    Retryable(String),
    /// Fail fatally.
    Fatal(String),
    /// Fail with a feature-not-supported error.
    NotSupported(String),
    /// Never return; only cancellation ends the call.
    Hang,
}

/// A [`Provider`] that replays a script.
pub struct FakeProvider {
    name: String,
    script: Mutex<VecDeque<Scripted>>,
    default_response: Option<String>,
    usage: Usage,
    max_concurrent: Option<usize>,
    calls: Arc<AtomicU32>,
}

impl FakeProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            default_response: None,
            usage: Usage {
                input_tokens: Some(10),
                output_tokens: Some(5),
            },
            max_concurrent: None,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Answer returned whenever the script is exhausted.
    pub fn with_default_response(mut self, text: impl Into<String>) -> Self {
        self.default_response = Some(text.into());
        self
    }

    pub fn with_script(mut self, outcomes: Vec<Scripted>) -> Self {
        self.script = Mutex::new(outcomes.into());
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_max_concurrent(mut self, cap: usize) -> Self {
        self.max_concurrent = Some(cap);
        self
    }

    /// Shared call counter; survives moving the provider into an `Arc`.
    pub fn call_count_handle(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.calls)
    }

    fn next_outcome(&self) -> Option<Scripted> {
        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        script.pop_front()
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_concurrent_requests(&self) -> Option<usize> {
        self.max_concurrent
    }

    async fn run(
        &self,
        _logger: &Logger,
        _run: &RunConfig,
        _task: &Task,
    ) -> Result<ProviderAnswer, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.next_outcome().or_else(|| {
            self.default_response
                .clone()
                .map(Scripted::Answer)
        });
        match outcome {
            Some(Scripted::Answer(text)) => Ok(ProviderAnswer {
                text,
                usage: self.usage,
            }),
            Some(Scripted::AnswerAfter(delay, text)) => {
                tokio::time::sleep(delay).await;
                Ok(ProviderAnswer {
                    text,
                    usage: self.usage,
                })
            }
            Some(Scripted::Retryable(msg)) => {
                Err(ProviderError::Retryable(anyhow::anyhow!("{}", msg)))
            }
            Some(Scripted::Fatal(msg)) => Err(ProviderError::Other(anyhow::anyhow!("{}", msg))),
            Some(Scripted::NotSupported(msg)) => Err(ProviderError::FeatureNotSupported(msg)),
            Some(Scripted::Hang) => {
                // Parked until the caller drops the future.
                futures::future::pending::<()>().await;
                unreachable!("pending future resolved")
            }
            None => Err(ProviderError::Other(anyhow::anyhow!(
                "fake provider '{}' has no scripted response left",
                self.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ResponseFormat, ValidationRules, ValueSet};

    fn task() -> Task {
        Task {
            name: "t".to_string(),
            prompt: "p".to_string(),
            system_prompt: None,
            response_format: ResponseFormat::Text("text".to_string()),
            expected_result: ValueSet::from(vec!["p"]),
            files: Vec::new(),
            rules: ValidationRules::default(),
        }
    }

    fn run_config() -> RunConfig {
        RunConfig {
            name: "r".to_string(),
            model: "m".to_string(),
            max_requests_per_minute: 0,
            disabled: None,
            model_params: None,
            retry_policy: None,
        }
    }

    #[tokio::test]
    async fn test_script_plays_in_order_then_default() {
        let provider = FakeProvider::new("fake")
            .with_script(vec![Scripted::Answer("first".to_string())])
            .with_default_response("later");
        let logger = Logger::discard();

        let a = provider.run(&logger, &run_config(), &task()).await.unwrap();
        assert_eq!(a.text, "first");
        let b = provider.run(&logger, &run_config(), &task()).await.unwrap();
        assert_eq!(b.text, "later");
        assert_eq!(provider.call_count_handle().load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_exhausted_script_without_default_errors() {
        let provider = FakeProvider::new("fake");
        let result = provider.run(&Logger::discard(), &run_config(), &task()).await;
        assert!(result.is_err());
    }
}
