//! End-to-end batch scenarios driven through the public runner surface with
//! scripted fake providers. No network is involved; call counts, record
//! counts and stream behavior are asserted exactly.

use std::sync::Arc;
use std::time::Duration;

use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use mindtrial::config::{
    ClientSettings, JudgeConfig, JudgeSelector, ProviderConfig, ProviderName, ResponseFormat,
    RetryPolicy, RunConfig, Task, ValidationRules, ValueSet,
};
use mindtrial::logging::Logger;
use mindtrial::providers::fake::{FakeProvider, Scripted};
use mindtrial::providers::Provider;
use mindtrial::results::{FinalAnswer, Kind};
use mindtrial::runner::Runner;
use mindtrial::validation::{JudgeValidator, ValidatorFactory};

fn run_config(name: &str) -> RunConfig {
    RunConfig {
        name: name.to_string(),
        model: format!("model-{}", name),
        max_requests_per_minute: 0,
        disabled: None,
        model_params: None,
        retry_policy: None,
    }
}

fn provider_config(runs: Vec<RunConfig>) -> ProviderConfig {
    ProviderConfig {
        name: ProviderName::Openai,
        client: ClientSettings::Openai {
            api_key: "unused".to_string(),
            base_url: None,
        },
        disabled: false,
        runs,
    }
}

fn text_task(name: &str, prompt: &str, expected: Vec<&str>) -> Task {
    Task {
        name: name.to_string(),
        prompt: prompt.to_string(),
        system_prompt: None,
        response_format: ResponseFormat::Text("a short answer".to_string()),
        expected_result: ValueSet::from(expected),
        files: Vec::new(),
        rules: ValidationRules::default(),
    }
}

fn single_provider_runner(provider: FakeProvider, runs: Vec<RunConfig>) -> Runner {
    Runner::from_parts(
        vec![(provider_config(runs), Arc::new(provider) as Arc<dyn Provider>)],
        ValidatorFactory::new(Vec::new()),
        Logger::discard(),
    )
}

#[tokio::test]
async fn scenario_single_success() {
    mindtrial::logging::init_tracing();
    let provider = FakeProvider::new("alpha").with_default_response("Paris");
    let runner = single_provider_runner(provider, vec![run_config("default")]);

    let mut set = runner
        .start(
            &CancellationToken::new(),
            vec![text_task("capital", "Capital of France?", vec!["Paris"])],
        )
        .unwrap();
    let mut progress = set.progress_events().unwrap();

    let results = set.results().await;
    let records = results.get("alpha").unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, Kind::Success);
    assert_eq!(
        records[0].got,
        Some(FinalAnswer::Text("Paris".to_string()))
    );
    assert_eq!(records[0].want, ValueSet::from(vec!["Paris"]));
    assert!(records[0].details.validation.is_some());

    // Exactly one progress event, value 1.0, then closure.
    assert_eq!(progress.next().await, Some(1.0));
    assert_eq!(progress.next().await, None);

    runner.close().await;
}

#[tokio::test]
async fn scenario_case_insensitive_default() {
    let provider = FakeProvider::new("alpha").with_default_response("  paris\n");
    let runner = single_provider_runner(provider, vec![run_config("default")]);

    let results = runner
        .run(
            &CancellationToken::new(),
            vec![text_task("capital", "Capital of France?", vec!["Paris"])],
        )
        .await
        .unwrap();
    assert_eq!(results.get("alpha").unwrap()[0].kind, Kind::Success);
    runner.close().await;
}

#[tokio::test]
async fn scenario_structured_schema_violation() {
    let provider = FakeProvider::new("alpha").with_default_response(r#"{"answer": "four"}"#);
    let runner = single_provider_runner(provider, vec![run_config("default")]);

    let schema = serde_json::json!({
        "type": "object",
        "properties": {"answer": {"type": "number"}},
        "required": ["answer"]
    });
    let task = Task {
        name: "sum".to_string(),
        prompt: "What is 2 + 2?".to_string(),
        system_prompt: None,
        response_format: ResponseFormat::Schema(schema.as_object().unwrap().clone()),
        expected_result: ValueSet::new(vec![serde_json::json!({"answer": 4})]),
        files: Vec::new(),
        rules: ValidationRules::default(),
    };

    let results = runner
        .run(&CancellationToken::new(), vec![task])
        .await
        .unwrap();
    let record = &results.get("alpha").unwrap()[0];
    assert_eq!(record.kind, Kind::Error);
    let error = record.details.error.as_ref().unwrap();
    assert!(error.message.contains("does not conform"));
    assert!(error.diagnostics.contains_key("raw_response"));
    runner.close().await;
}

#[tokio::test]
async fn scenario_retry_exhausted_then_success() {
    let provider = FakeProvider::new("alpha").with_script(vec![
        Scripted::Retryable("429".to_string()),
        Scripted::Retryable("503".to_string()),
        Scripted::Answer("Paris".to_string()),
    ]);
    let calls = provider.call_count_handle();

    let mut run = run_config("default");
    run.retry_policy = Some(RetryPolicy {
        max_retry_attempts: 2,
        initial_delay_ms: 1,
        backoff_multiplier: 2.0,
        max_delay_ms: None,
        jitter_ms: Some(0),
    });
    let runner = single_provider_runner(provider, vec![run]);

    let results = runner
        .run(
            &CancellationToken::new(),
            vec![text_task("capital", "Capital of France?", vec!["Paris"])],
        )
        .await
        .unwrap();
    assert_eq!(results.get("alpha").unwrap()[0].kind, Kind::Success);
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    runner.close().await;
}

#[tokio::test]
async fn scenario_judge_semantic_match() {
    // The answering model replies with prose that exact matching rejects;
    // the judge grades it as semantically correct.
    let provider = FakeProvider::new("alpha")
        .with_default_response("The answer is forty-two.");

    let judge_provider = FakeProvider::new("judge")
        .with_default_response(r#"{"correct": true}"#)
        .with_usage(mindtrial::results::Usage {
            input_tokens: Some(200),
            output_tokens: Some(3),
        });
    let judge_calls = judge_provider.call_count_handle();

    let mut factory = ValidatorFactory::new(vec![JudgeConfig {
        name: "strict".to_string(),
        provider: provider_config(vec![run_config("grader")]),
    }]);
    factory.preload(
        "strict",
        "grader",
        Arc::new(JudgeValidator::with_provider(
            "strict".to_string(),
            Arc::new(judge_provider),
            run_config("grader"),
        )),
    );

    let runner = Runner::from_parts(
        vec![(
            provider_config(vec![run_config("default")]),
            Arc::new(provider) as Arc<dyn Provider>,
        )],
        factory,
        Logger::discard(),
    );

    let mut task = text_task("answer", "What is the answer?", vec!["42", "forty-two"]);
    task.rules = ValidationRules {
        case_sensitive: None,
        ignore_whitespace: None,
        trim_lines: None,
        judge: Some(JudgeSelector {
            enabled: Some(true),
            name: Some("strict".to_string()),
            variant: Some("grader".to_string()),
        }),
    };

    let results = runner
        .run(&CancellationToken::new(), vec![task])
        .await
        .unwrap();
    let record = &results.get("alpha").unwrap()[0];
    assert_eq!(record.kind, Kind::Success);
    let validation = record.details.validation.as_ref().unwrap();
    assert_eq!(validation.title, "Semantic Assessment");
    assert_eq!(validation.usage.input_tokens, Some(200));
    assert_eq!(judge_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    runner.close().await;
}

#[tokio::test]
async fn scenario_judge_negative_verdict_is_failure() {
    let provider = FakeProvider::new("alpha").with_default_response("forty-three");
    let judge_provider =
        FakeProvider::new("judge").with_default_response(r#"{"correct": false}"#);

    let mut factory = ValidatorFactory::new(vec![JudgeConfig {
        name: "strict".to_string(),
        provider: provider_config(vec![run_config("grader")]),
    }]);
    factory.preload(
        "strict",
        "grader",
        Arc::new(JudgeValidator::with_provider(
            "strict".to_string(),
            Arc::new(judge_provider),
            run_config("grader"),
        )),
    );

    let runner = Runner::from_parts(
        vec![(
            provider_config(vec![run_config("default")]),
            Arc::new(provider) as Arc<dyn Provider>,
        )],
        factory,
        Logger::discard(),
    );

    let mut task = text_task("answer", "What is the answer?", vec!["42"]);
    task.rules.judge = Some(JudgeSelector {
        enabled: Some(true),
        name: Some("strict".to_string()),
        variant: Some("grader".to_string()),
    });

    let results = runner
        .run(&CancellationToken::new(), vec![task])
        .await
        .unwrap();
    assert_eq!(results.get("alpha").unwrap()[0].kind, Kind::Failure);
    runner.close().await;
}

#[tokio::test]
async fn scenario_unknown_judge_fails_the_batch_up_front() {
    let provider = FakeProvider::new("alpha").with_default_response("x");
    let runner = single_provider_runner(provider, vec![run_config("default")]);

    let mut task = text_task("t", "p", vec!["x"]);
    task.rules.judge = Some(JudgeSelector {
        enabled: Some(true),
        name: Some("nobody".to_string()),
        variant: None,
    });

    assert!(runner.start(&CancellationToken::new(), vec![task]).is_err());
    runner.close().await;
}

#[tokio::test]
async fn scenario_not_supported_kind() {
    let provider = FakeProvider::new("alpha")
        .with_script(vec![Scripted::NotSupported("no attachments".to_string())]);
    let runner = single_provider_runner(provider, vec![run_config("default")]);

    let results = runner
        .run(&CancellationToken::new(), vec![text_task("t", "p", vec!["x"])])
        .await
        .unwrap();
    assert_eq!(results.get("alpha").unwrap()[0].kind, Kind::NotSupported);
    runner.close().await;
}

#[tokio::test]
async fn matrix_counts_ordering_and_progress() {
    let alpha = FakeProvider::new("alpha").with_default_response("x");
    let beta = FakeProvider::new("beta").with_default_response("x");

    let runner = Runner::from_parts(
        vec![
            (
                provider_config(vec![run_config("r1"), run_config("r2")]),
                Arc::new(alpha) as Arc<dyn Provider>,
            ),
            (
                provider_config(vec![run_config("r1")]),
                Arc::new(beta) as Arc<dyn Provider>,
            ),
        ],
        ValidatorFactory::new(Vec::new()),
        Logger::discard(),
    );

    let tasks = vec![
        text_task("t1", "p1", vec!["x"]),
        text_task("t2", "p2", vec!["x"]),
        text_task("t3", "p3", vec!["x"]),
    ];
    let mut set = runner
        .start(&CancellationToken::new(), tasks)
        .unwrap();
    let mut progress = set.progress_events().unwrap();

    let results = set.results().await;

    // |Results| = providers, sum of records = N * M.
    assert_eq!(results.provider_count(), 2);
    assert_eq!(results.record_count(), 9);

    // Per provider: (run, task) enqueue order.
    let alpha_records = results.get("alpha").unwrap();
    let order: Vec<(String, String)> = alpha_records
        .iter()
        .map(|r| (r.run.clone(), r.task.clone()))
        .collect();
    assert_eq!(
        order,
        vec![
            ("r1".to_string(), "t1".to_string()),
            ("r1".to_string(), "t2".to_string()),
            ("r1".to_string(), "t3".to_string()),
            ("r2".to_string(), "t1".to_string()),
            ("r2".to_string(), "t2".to_string()),
            ("r2".to_string(), "t3".to_string()),
        ]
    );

    // One progress event per record, monotonic, ending at 1.0, closed once.
    let mut events = Vec::new();
    while let Some(value) = progress.next().await {
        events.push(value);
    }
    assert_eq!(events.len(), 9);
    assert!(events.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(*events.last().unwrap(), 1.0);

    runner.close().await;
}

#[tokio::test]
async fn scenario_cancellation_mid_batch() {
    let mut providers = Vec::new();
    for name in ["alpha", "beta", "gamma"] {
        let mut script = Vec::new();
        for _ in 0..20 {
            script.push(Scripted::AnswerAfter(
                Duration::from_millis(10),
                "x".to_string(),
            ));
        }
        providers.push((
            provider_config(vec![run_config("r1"), run_config("r2")]),
            Arc::new(FakeProvider::new(name).with_script(script)) as Arc<dyn Provider>,
        ));
    }
    let runner = Runner::from_parts(providers, ValidatorFactory::new(Vec::new()), Logger::discard());

    let tasks: Vec<Task> = (0..10)
        .map(|i| text_task(&format!("t{}", i), "p", vec!["x"]))
        .collect();

    let mut set = runner.start(&CancellationToken::new(), tasks).unwrap();
    let mut progress = set.progress_events().unwrap();
    let mut messages = set.message_events().unwrap();

    // Cancel once roughly a third of the batch has been recorded.
    let mut seen = 0;
    while let Some(_) = progress.next().await {
        seen += 1;
        if seen == 20 {
            set.cancel();
            break;
        }
    }

    let results = set.results().await;
    assert_eq!(results.provider_count(), 3);
    assert_eq!(results.record_count(), 60);

    let cancelled = results
        .providers()
        .flat_map(|group| group.records.iter())
        .filter(|record| {
            record.kind == Kind::Error
                && record
                    .details
                    .error
                    .as_ref()
                    .is_some_and(|e| e.diagnostics.get("cancelled").map(String::as_str) == Some("true"))
        })
        .count();
    assert!(cancelled > 0, "expected cancellation records");

    let completed = results
        .providers()
        .flat_map(|group| group.records.iter())
        .filter(|record| record.kind == Kind::Success)
        .count();
    assert!(completed >= 20, "completed {}", completed);

    // Both streams drain to closure exactly once.
    while progress.next().await.is_some() {}
    while messages.next().await.is_some() {}

    // Close returns promptly once the batch has drained.
    tokio::time::timeout(Duration::from_secs(5), runner.close())
        .await
        .expect("close timed out");
}

#[tokio::test]
async fn results_are_idempotent() {
    let provider = FakeProvider::new("alpha").with_default_response("x");
    let runner = single_provider_runner(provider, vec![run_config("default")]);

    let mut set = runner
        .start(&CancellationToken::new(), vec![text_task("t", "p", vec!["x"])])
        .unwrap();
    let first = set.results().await;
    let second = set.results().await;
    assert_eq!(first, second);
    runner.close().await;
}
