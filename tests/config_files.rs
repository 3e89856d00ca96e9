//! Loads the fixture configuration and task suite end to end: decode,
//! cross-field validation, enabled-set computation and task resolution.

use mindtrial::config::{Config, ProviderName, ResponseFormat, TaskSuite};

const CONFIG_YAML: &str = include_str!("fixtures/config.yaml");
const TASKS_YAML: &str = include_str!("fixtures/tasks.yaml");

#[test]
fn fixture_config_loads_and_validates() {
    let config = Config::from_yaml(CONFIG_YAML).unwrap();
    assert_eq!(config.providers.len(), 3);
    assert_eq!(config.judges.len(), 1);
    assert!(config.log_file.is_some());

    // google is disabled wholesale, and the disabled openai run drops out.
    let enabled = config.enabled_providers();
    assert_eq!(enabled.len(), 2);
    assert_eq!(enabled[0].name, ProviderName::Openai);
    assert_eq!(enabled[0].runs.len(), 1);
    assert_eq!(enabled[0].runs[0].name, "gpt-4o default");
    assert_eq!(enabled[1].name, ProviderName::Anthropic);

    let retry = enabled[0].runs[0].retry_policy();
    assert_eq!(retry.max_retry_attempts, 3);
    assert_eq!(retry.max_delay_ms, Some(8_000));

    let judge_variants = config.judges[0].enabled_variants();
    assert_eq!(judge_variants.len(), 1);
    assert_eq!(judge_variants[0].name, "grader");
}

#[test]
fn fixture_tasks_resolve() {
    let suite = TaskSuite::from_yaml(TASKS_YAML).unwrap();
    let tasks = suite.resolve().unwrap();
    assert_eq!(tasks.len(), 3);

    // The suite template is expanded with the task's format description.
    let capital = &tasks[0];
    let system = capital.system_prompt.as_deref().unwrap();
    assert!(system.contains("Answer with the city name only."));
    assert!(!system.contains("{{"));

    // Structured task keeps its schema and validated expected values.
    let arithmetic = &tasks[1];
    assert!(matches!(arithmetic.response_format, ResponseFormat::Schema(_)));
    assert_eq!(arithmetic.expected_result.len(), 1);

    // Suite defaults merge into per-task rules; the judge selector rides
    // along on the third task.
    assert!(!tasks[0].rules.use_judge());
    assert!(tasks[2].rules.use_judge());
    assert_eq!(
        tasks[2].rules.judge.as_ref().unwrap().name.as_deref(),
        Some("strict")
    );
    assert_eq!(tasks[2].rules.case_sensitive, Some(false));
}

#[test]
fn fixture_log_pattern_expands() {
    let config = Config::from_yaml(CONFIG_YAML).unwrap();
    let pattern = config.log_file.unwrap();
    let now = chrono::Local::now();
    let name = mindtrial::config::template::expand_file_name_pattern(&pattern, now).unwrap();
    assert!(name.starts_with("mindtrial-"));
    assert!(name.ends_with(".log"));
    assert!(!name.contains("{{"));
}
