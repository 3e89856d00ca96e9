//! Configuration domain model.
//!
//! Everything the scheduler consumes is defined here: provider blocks with
//! their run configurations, judge definitions, task suites, validation
//! rules, retry policies. Documents are YAML with `snake_case` fields and
//! strict unknown-field rejection.
//!
//! Client settings and model parameters are tagged unions dispatched on the
//! provider name; a block tagged for a different provider than the one it is
//! attached to is rejected during validation.

pub mod file_ref;
pub mod template;

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use file_ref::{FileError, TaskFile};

/// Errors surfaced while loading or validating configuration. All of these
/// are fatal to the batch: nothing is dispatched from a bad config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("provider '{provider}': client settings are tagged for provider '{client}'")]
    ForeignClientSettings { provider: String, client: String },

    #[error("provider '{provider}' run '{run}': model parameters are tagged for provider '{params}'")]
    ForeignModelParams {
        provider: String,
        run: String,
        params: String,
    },

    #[error("duplicate task name '{0}'")]
    DuplicateTask(String),

    #[error("no judge named '{0}' is configured")]
    UnknownJudge(String),

    #[error("judge '{name}' has no enabled run variant '{variant}'")]
    UnknownJudgeVariant { name: String, variant: String },

    #[error("judge validation requires a plain-text response format (task '{0}')")]
    JudgeWithStructuredFormat(String),

    #[error("task '{task}': response schema is not a valid JSON schema: {detail}")]
    InvalidSchema { task: String, detail: String },

    #[error("task '{task}': expected value #{index} must be a string for a plain-text response format")]
    ExpectedValueNotString { task: String, index: usize },

    #[error("task '{task}': expected value #{index} does not conform to the response schema: {detail}")]
    ExpectedValueSchema {
        task: String,
        index: usize,
        detail: String,
    },

    #[error("template error: {0}")]
    Template(#[from] handlebars::RenderError),

    #[error(transparent)]
    File(#[from] FileError),
}

/// Resolve a run-level flag against its provider-level default: the run
/// override wins when present.
pub fn resolve_flag_override(run: Option<bool>, provider: bool) -> bool {
    run.unwrap_or(provider)
}

// ---------------------------------------------------------------------------
// Providers and runs
// ---------------------------------------------------------------------------

/// Supported provider APIs. Deepseek, OpenRouter and Mistral speak the
/// OpenAI-compatible wire protocol against their own endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderName {
    Openai,
    Anthropic,
    Google,
    Deepseek,
    Openrouter,
    Mistral,
}

impl ProviderName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderName::Openai => "openai",
            ProviderName::Anthropic => "anthropic",
            ProviderName::Google => "google",
            ProviderName::Deepseek => "deepseek",
            ProviderName::Openrouter => "openrouter",
            ProviderName::Mistral => "mistral",
        }
    }
}

impl std::fmt::Display for ProviderName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-provider client settings, tagged on the provider name so a foreign
/// block fails validation instead of silently decoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase", deny_unknown_fields)]
pub enum ClientSettings {
    Openai {
        api_key: String,
        #[serde(default)]
        base_url: Option<String>,
    },
    Anthropic {
        api_key: String,
        #[serde(default)]
        request_timeout_seconds: Option<u64>,
    },
    Google {
        api_key: String,
    },
    Deepseek {
        api_key: String,
    },
    Openrouter {
        api_key: String,
        #[serde(default)]
        app_name: Option<String>,
    },
    Mistral {
        api_key: String,
    },
}

impl ClientSettings {
    pub fn provider(&self) -> ProviderName {
        match self {
            ClientSettings::Openai { .. } => ProviderName::Openai,
            ClientSettings::Anthropic { .. } => ProviderName::Anthropic,
            ClientSettings::Google { .. } => ProviderName::Google,
            ClientSettings::Deepseek { .. } => ProviderName::Deepseek,
            ClientSettings::Openrouter { .. } => ProviderName::Openrouter,
            ClientSettings::Mistral { .. } => ProviderName::Mistral,
        }
    }

    pub fn api_key(&self) -> &str {
        match self {
            ClientSettings::Openai { api_key, .. }
            | ClientSettings::Anthropic { api_key, .. }
            | ClientSettings::Google { api_key }
            | ClientSettings::Deepseek { api_key }
            | ClientSettings::Openrouter { api_key, .. }
            | ClientSettings::Mistral { api_key } => api_key,
        }
    }
}

/// Model parameters, tagged like [`ClientSettings`]. Only the knobs each API
/// actually accepts are representable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase", deny_unknown_fields)]
pub enum ModelParams {
    Openai {
        #[serde(default)]
        temperature: Option<f64>,
        #[serde(default)]
        top_p: Option<f64>,
        #[serde(default)]
        max_tokens: Option<u32>,
        #[serde(default)]
        reasoning_effort: Option<String>,
    },
    Anthropic {
        #[serde(default)]
        temperature: Option<f64>,
        #[serde(default)]
        max_tokens: Option<u32>,
        #[serde(default)]
        thinking_budget_tokens: Option<u32>,
    },
    Google {
        #[serde(default)]
        temperature: Option<f64>,
        #[serde(default)]
        top_k: Option<u32>,
        #[serde(default)]
        max_output_tokens: Option<u32>,
    },
    Deepseek {
        #[serde(default)]
        temperature: Option<f64>,
        #[serde(default)]
        max_tokens: Option<u32>,
    },
    Openrouter {
        #[serde(default)]
        temperature: Option<f64>,
        #[serde(default)]
        max_tokens: Option<u32>,
    },
    Mistral {
        #[serde(default)]
        temperature: Option<f64>,
        #[serde(default)]
        max_tokens: Option<u32>,
    },
}

impl ModelParams {
    pub fn provider(&self) -> ProviderName {
        match self {
            ModelParams::Openai { .. } => ProviderName::Openai,
            ModelParams::Anthropic { .. } => ProviderName::Anthropic,
            ModelParams::Google { .. } => ProviderName::Google,
            ModelParams::Deepseek { .. } => ProviderName::Deepseek,
            ModelParams::Openrouter { .. } => ProviderName::Openrouter,
            ModelParams::Mistral { .. } => ProviderName::Mistral,
        }
    }
}

/// Retry behavior for one run configuration. `max_retry_attempts == 0`
/// disables retries entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_retry_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound on a single wait. Unset means the exponential grows
    /// unclamped.
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
    /// Upper bound of the uniform jitter added to each wait. Unset means
    /// `min(wait / 2, 1s)`.
    #[serde(default)]
    pub jitter_ms: Option<u64>,
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry_attempts: 0,
            initial_delay_ms: default_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: None,
            jitter_ms: None,
        }
    }
}

impl RetryPolicy {
    /// Base wait (before jitter) for the given retry, 1-indexed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let wait = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent as i32);
        let wait = match self.max_delay_ms {
            Some(max) => wait.min(max as f64),
            None => wait,
        };
        Duration::from_millis(wait.max(0.0) as u64)
    }

    /// Exclusive upper bound of the jitter applied on top of `wait`.
    pub fn jitter_bound(&self, wait: Duration) -> Duration {
        match self.jitter_ms {
            Some(ms) => Duration::from_millis(ms),
            None => (wait / 2).min(Duration::from_secs(1)),
        }
    }
}

/// One `(model, knobs)` tuple under a provider block. The batch matrix
/// cross-joins enabled runs with tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Display name; identifies the run in results and logs.
    pub name: String,
    /// Model identifier as the provider API expects it.
    pub model: String,
    /// Requests-per-minute admission limit; 0 means unlimited.
    #[serde(default)]
    pub max_requests_per_minute: u32,
    /// Override of the provider-level disabled flag; unset inherits.
    #[serde(default)]
    pub disabled: Option<bool>,
    #[serde(default)]
    pub model_params: Option<ModelParams>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

impl RunConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy.clone().unwrap_or_default()
    }
}

/// A named provider block: credentials plus an ordered list of runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    pub name: ProviderName,
    pub client: ClientSettings,
    #[serde(default)]
    pub disabled: bool,
    pub runs: Vec<RunConfig>,
}

impl ProviderConfig {
    /// Runs that remain enabled after resolving per-run overrides against
    /// the provider flag. Order-preserving.
    pub fn enabled_runs(&self) -> Vec<&RunConfig> {
        self.runs
            .iter()
            .filter(|run| !resolve_flag_override(run.disabled, self.disabled))
            .collect()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.client.provider() != self.name {
            return Err(ConfigError::ForeignClientSettings {
                provider: self.name.to_string(),
                client: self.client.provider().to_string(),
            });
        }
        for run in &self.runs {
            if let Some(params) = &run.model_params {
                if params.provider() != self.name {
                    return Err(ConfigError::ForeignModelParams {
                        provider: self.name.to_string(),
                        run: run.name.clone(),
                        params: params.provider().to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Retain only providers with at least one enabled run, each reduced to its
/// enabled runs. Provider and run order is preserved.
pub fn providers_with_enabled_runs(providers: &[ProviderConfig]) -> Vec<ProviderConfig> {
    providers
        .iter()
        .filter_map(|provider| {
            let runs: Vec<RunConfig> = provider
                .enabled_runs()
                .into_iter()
                .cloned()
                .collect();
            if runs.is_empty() {
                None
            } else {
                Some(ProviderConfig {
                    runs,
                    ..provider.clone()
                })
            }
        })
        .collect()
}

/// A judge: a provider block whose enabled runs are the allowed grading
/// variants, addressed by name from [`JudgeSelector`]s.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JudgeConfig {
    pub name: String,
    pub provider: ProviderConfig,
}

impl JudgeConfig {
    pub fn enabled_variants(&self) -> Vec<&RunConfig> {
        self.provider.enabled_runs()
    }
}

/// Top-level harness configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub judges: Vec<JudgeConfig>,
    /// Optional log file name pattern; supports the timestamp placeholders
    /// `{{year}}` through `{{second}}`.
    #[serde(default)]
    pub log_file: Option<String>,
}

impl Config {
    pub fn from_yaml(input: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for provider in &self.providers {
            provider.validate()?;
        }
        for judge in &self.judges {
            judge.provider.validate()?;
        }
        Ok(())
    }

    /// Providers that survive the enabled-set computation, in config order.
    pub fn enabled_providers(&self) -> Vec<ProviderConfig> {
        providers_with_enabled_runs(&self.providers)
    }
}

// ---------------------------------------------------------------------------
// Response formats and expected values
// ---------------------------------------------------------------------------

/// How the model is expected to answer: either a free-form instruction shown
/// verbatim, or a JSON schema the response must conform to. A YAML scalar
/// decodes to the former, a mapping to the latter; any other shape fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseFormat {
    Text(String),
    Schema(serde_json::Map<String, serde_json::Value>),
}

impl ResponseFormat {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ResponseFormat::Text(text) => Some(text),
            ResponseFormat::Schema(_) => None,
        }
    }

    pub fn as_schema(&self) -> Option<&serde_json::Map<String, serde_json::Value>> {
        match self {
            ResponseFormat::Text(_) => None,
            ResponseFormat::Schema(schema) => Some(schema),
        }
    }

    pub fn is_structured(&self) -> bool {
        matches!(self, ResponseFormat::Schema(_))
    }

    /// Human-readable description of the format, used in prompts and by the
    /// judge template.
    pub fn describe(&self) -> String {
        match self {
            ResponseFormat::Text(text) => text.clone(),
            ResponseFormat::Schema(schema) => {
                format!(
                    "JSON conforming to this schema: {}",
                    serde_json::Value::Object(schema.clone())
                )
            }
        }
    }
}

/// Ordered set of accepted answers. A task succeeds when the model's answer
/// matches any element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValueSet(Vec<serde_json::Value>);

impl ValueSet {
    pub fn new(values: Vec<serde_json::Value>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[serde_json::Value] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// All elements as strings, or `None` if any element is non-string.
    pub fn as_string_set(&self) -> Option<Vec<String>> {
        self.0
            .iter()
            .map(|value| value.as_str().map(str::to_string))
            .collect()
    }

    /// Check the load-time invariant: plain-text formats accept only string
    /// elements; structured formats require every element to conform to the
    /// schema.
    pub fn validate_against(&self, task: &str, format: &ResponseFormat) -> Result<(), ConfigError> {
        match format {
            ResponseFormat::Text(_) => {
                for (index, value) in self.0.iter().enumerate() {
                    if !value.is_string() {
                        return Err(ConfigError::ExpectedValueNotString {
                            task: task.to_string(),
                            index,
                        });
                    }
                }
                Ok(())
            }
            ResponseFormat::Schema(schema) => {
                let schema_value = serde_json::Value::Object(schema.clone());
                let validator = jsonschema::validator_for(&schema_value).map_err(|err| {
                    ConfigError::InvalidSchema {
                        task: task.to_string(),
                        detail: err.to_string(),
                    }
                })?;
                for (index, value) in self.0.iter().enumerate() {
                    if let Err(err) = validator.validate(value) {
                        return Err(ConfigError::ExpectedValueSchema {
                            task: task.to_string(),
                            index,
                            detail: err.to_string(),
                        });
                    }
                }
                Ok(())
            }
        }
    }
}

impl From<Vec<&str>> for ValueSet {
    fn from(values: Vec<&str>) -> Self {
        Self(values.into_iter().map(|v| v.into()).collect())
    }
}

// ---------------------------------------------------------------------------
// Validation rules
// ---------------------------------------------------------------------------

/// Selects a judge for semantic validation. Two selectors address the same
/// cached validator iff `(name, variant)` match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JudgeSelector {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub variant: Option<String>,
}

impl JudgeSelector {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(false)
    }

    /// Field-wise merge; `other`'s fields win when present.
    pub fn merge_with(&self, other: Option<&JudgeSelector>) -> JudgeSelector {
        let Some(other) = other else {
            return self.clone();
        };
        JudgeSelector {
            enabled: other.enabled.or(self.enabled),
            name: other.name.clone().or_else(|| self.name.clone()),
            variant: other.variant.clone().or_else(|| self.variant.clone()),
        }
    }

    /// Cache key for the validator factory.
    pub fn cache_key(&self) -> (String, String) {
        (
            self.name.clone().unwrap_or_default(),
            self.variant.clone().unwrap_or_default(),
        )
    }
}

/// Optional overrides controlling answer comparison. Missing fields default
/// to `false` at the accessors; merge keeps the base value unless the
/// override sets one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationRules {
    #[serde(default)]
    pub case_sensitive: Option<bool>,
    #[serde(default)]
    pub ignore_whitespace: Option<bool>,
    #[serde(default)]
    pub trim_lines: Option<bool>,
    #[serde(default)]
    pub judge: Option<JudgeSelector>,
}

impl ValidationRules {
    /// Field-wise merge; scalar fields of `other` win when present, and the
    /// judge sub-record merges by the same rule. `None` is identity.
    pub fn merge_with(&self, other: Option<&ValidationRules>) -> ValidationRules {
        let Some(other) = other else {
            return self.clone();
        };
        let judge = match (&self.judge, &other.judge) {
            (Some(base), overlay) => Some(base.merge_with(overlay.as_ref())),
            (None, Some(overlay)) => Some(overlay.clone()),
            (None, None) => None,
        };
        ValidationRules {
            case_sensitive: other.case_sensitive.or(self.case_sensitive),
            ignore_whitespace: other.ignore_whitespace.or(self.ignore_whitespace),
            trim_lines: other.trim_lines.or(self.trim_lines),
            judge,
        }
    }

    pub fn is_case_sensitive(&self) -> bool {
        self.case_sensitive.unwrap_or(false)
    }

    pub fn is_ignore_whitespace(&self) -> bool {
        self.ignore_whitespace.unwrap_or(false)
    }

    pub fn is_trim_lines(&self) -> bool {
        self.trim_lines.unwrap_or(false)
    }

    pub fn use_judge(&self) -> bool {
        self.judge.as_ref().is_some_and(JudgeSelector::is_enabled)
    }

    /// Textual summary rendered into the judge's grading prompt.
    pub fn describe(&self) -> String {
        format!(
            "case sensitive: {}, ignore whitespace: {}, trim lines: {}",
            self.is_case_sensitive(),
            self.is_ignore_whitespace(),
            self.is_trim_lines()
        )
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// A task as written in the suite file, before resolution.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    /// Unique display name within the suite.
    pub name: String,
    /// User prompt shown to the model.
    pub prompt: String,
    /// Per-task system prompt; overrides the suite template when set.
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub response_format: ResponseFormat,
    pub expected_result: ValueSet,
    #[serde(default)]
    pub files: Vec<TaskFile>,
    #[serde(default)]
    pub validation_rules: Option<ValidationRules>,
}

impl TaskConfig {
    /// Final system prompt: the per-task override verbatim, or the suite
    /// template with `{{response_result_format}}` expanded, or nothing.
    pub fn resolve_system_prompt(
        &self,
        suite_template: Option<&str>,
    ) -> Result<Option<String>, ConfigError> {
        if let Some(own) = &self.system_prompt {
            return Ok(Some(own.clone()));
        }
        match suite_template {
            Some(tpl) => {
                let rendered =
                    template::expand_system_prompt(tpl, &self.response_format.describe())?;
                Ok(Some(rendered))
            }
            None => Ok(None),
        }
    }

    /// Final validation rules: suite defaults overridden by per-task rules.
    pub fn resolve_validation_rules(&self, suite_defaults: &ValidationRules) -> ValidationRules {
        suite_defaults.merge_with(self.validation_rules.as_ref())
    }
}

/// A resolved, immutable unit of work: prompts finalized, rules merged,
/// expected values checked against the response format.
#[derive(Debug, Clone)]
pub struct Task {
    pub name: String,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub response_format: ResponseFormat,
    pub expected_result: ValueSet,
    pub files: Vec<TaskFile>,
    pub rules: ValidationRules,
}

/// A suite of tasks with shared defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSuite {
    /// System prompt template; may reference `{{response_result_format}}`.
    #[serde(default)]
    pub system_prompt_template: Option<String>,
    /// Default validation rules merged into every task.
    #[serde(default)]
    pub validation_rules: Option<ValidationRules>,
    pub tasks: Vec<TaskConfig>,
}

impl TaskSuite {
    pub fn from_yaml(input: &str) -> Result<Self, ConfigError> {
        let suite: TaskSuite = serde_yaml::from_str(input)?;
        Ok(suite)
    }

    /// Resolve every task into an immutable work unit, enforcing name
    /// uniqueness, format/expected-value invariants and local file
    /// existence.
    pub fn resolve(&self) -> Result<Vec<Task>, ConfigError> {
        let defaults = self.validation_rules.clone().unwrap_or_default();
        let mut seen = HashSet::new();
        let mut tasks = Vec::with_capacity(self.tasks.len());
        for config in &self.tasks {
            if !seen.insert(config.name.clone()) {
                return Err(ConfigError::DuplicateTask(config.name.clone()));
            }
            config
                .expected_result
                .validate_against(&config.name, &config.response_format)?;
            let rules = config.resolve_validation_rules(&defaults);
            if rules.use_judge() && config.response_format.is_structured() {
                return Err(ConfigError::JudgeWithStructuredFormat(config.name.clone()));
            }
            for file in &config.files {
                file.validate_local()?;
            }
            tasks.push(Task {
                name: config.name.clone(),
                prompt: config.prompt.clone(),
                system_prompt: config
                    .resolve_system_prompt(self.system_prompt_template.as_deref())?,
                response_format: config.response_format.clone(),
                expected_result: config.expected_result.clone(),
                files: config.files.clone(),
                rules,
            });
        }
        Ok(tasks)
    }
}
