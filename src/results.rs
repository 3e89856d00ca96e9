//! Result records produced by the batch.
//!
//! One [`RunResult`] exists for every `(run, task)` pair the batch was asked
//! to execute, including pairs that were cancelled before their provider
//! call was issued. Records are append-once: nothing mutates a result after
//! the collector has stored it.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ValueSet;

/// Outcome class of a single `(run, task)` execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Kind {
    /// Answer obtained and validated as correct.
    Success,
    /// Answer obtained but it did not match the expected values.
    Failure,
    /// The answer or validation stage failed.
    Error,
    /// The provider cannot perform this task at all.
    NotSupported,
}

/// Token usage of one model call. `None` means the provider did not report
/// the figure. Answer-stage and validation-stage usage are carried
/// separately so token costs are never conflated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
}

/// The model's final answer after response-format interpretation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FinalAnswer {
    Text(String),
    Json(serde_json::Value),
}

impl FinalAnswer {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FinalAnswer::Text(text) => Some(text),
            FinalAnswer::Json(_) => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            FinalAnswer::Text(_) => None,
            FinalAnswer::Json(value) => Some(value),
        }
    }
}

impl std::fmt::Display for FinalAnswer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FinalAnswer::Text(text) => f.write_str(text),
            FinalAnswer::Json(value) => write!(f, "{}", value),
        }
    }
}

/// Answer-stage details: what was asked, what came back, what it cost.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnswerDetails {
    pub title: String,
    pub explanation: String,
    pub system_prompt: Option<String>,
    pub user_prompt: String,
    /// The provider's raw answer before canonicalization or JSON repair.
    pub actual_answer: String,
    pub usage: Usage,
}

/// Validation-stage details.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationDetails {
    pub title: String,
    pub explanation: String,
    pub usage: Usage,
}

/// Error details with a free-form diagnostic map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub title: String,
    pub message: String,
    pub diagnostics: BTreeMap<String, String>,
    pub usage: Usage,
}

/// Per-stage sub-records of a result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Details {
    pub answer: Option<AnswerDetails>,
    pub validation: Option<ValidationDetails>,
    pub error: Option<ErrorDetails>,
}

/// The record for one `(run, task)` execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    /// Unique per execution; correlates log lines with result rows.
    pub trace_id: Uuid,
    pub provider: String,
    pub run: String,
    pub task: String,
    pub kind: Kind,
    /// Wall clock for the answer stage, retries included.
    pub duration: Duration,
    pub want: ValueSet,
    pub got: Option<FinalAnswer>,
    pub details: Details,
}

/// All results of a finished batch, grouped by provider. Provider order and
/// the `(run, task)` order within each provider follow enqueue order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Results(Vec<ProviderResults>);

/// The ordered records of one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResults {
    pub provider: String,
    pub records: Vec<RunResult>,
}

impl Results {
    pub fn new(groups: Vec<ProviderResults>) -> Self {
        Self(groups)
    }

    pub fn providers(&self) -> impl Iterator<Item = &ProviderResults> {
        self.0.iter()
    }

    pub fn get(&self, provider: &str) -> Option<&[RunResult]> {
        self.0
            .iter()
            .find(|group| group.provider == provider)
            .map(|group| group.records.as_slice())
    }

    /// Number of provider groups.
    pub fn provider_count(&self) -> usize {
        self.0.len()
    }

    /// Total number of records across all providers.
    pub fn record_count(&self) -> usize {
        self.0.iter().map(|group| group.records.len()).sum()
    }
}
