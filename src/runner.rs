//! Batch scheduler.
//!
//! The runner cross-joins every enabled `(provider, run)` pair with the task
//! list. Each pair is a scheduling unit: units run concurrently, tasks
//! within a unit run in input order, and every unit self-throttles through
//! its `(provider, model)` rate limiter. A fan-in collector owns the result
//! slots and is the only writer of the final [`Results`].
//!
//! Cancellation flows through one child token per batch. Units observe it
//! between tasks and record the remaining work as cancelled, so a batch of
//! `N` tasks over `M` units always accounts for exactly `N * M` records.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{Config, ConfigError, ProviderConfig, RunConfig, Task};
use crate::executor::{ExecuteError, TaskExecutor, TaskResult};
use crate::logging::{ChannelSink, LogLevel, Logger};
use crate::providers::{create_provider, Provider};
use crate::ratelimit::RateLimiterPool;
use crate::results::{
    AnswerDetails, Details, ErrorDetails, Kind, ProviderResults, Results, RunResult,
    ValidationDetails,
};
use crate::validation::{ValidationError, ValidationResult, ValidatorFactory};

/// One enabled provider with its instantiated adapter.
struct ProviderUnit {
    config: ProviderConfig,
    provider: Arc<dyn Provider>,
}

/// Orchestrates batches across providers, runs and tasks. Owns the provider
/// adapters and the validator factory; both are released by [`Runner::close`].
pub struct Runner {
    units: Vec<ProviderUnit>,
    factory: Arc<ValidatorFactory>,
    limiters: Arc<RateLimiterPool>,
    logger: Logger,
    batches: Mutex<Vec<watch::Receiver<bool>>>,
}

impl Runner {
    /// Build a runner from configuration: instantiate an adapter for every
    /// provider that has at least one enabled run.
    pub fn new(config: &Config, logger: Logger) -> Self {
        let units = config
            .enabled_providers()
            .into_iter()
            .map(|provider_config| {
                let provider = create_provider(&provider_config);
                ProviderUnit {
                    config: provider_config,
                    provider,
                }
            })
            .collect();
        Self::assemble(units, ValidatorFactory::new(config.judges.clone()), logger)
    }

    /// Build a runner around pre-instantiated providers. Each entry must
    /// already be reduced to its enabled runs.
    pub fn from_parts(
        providers: Vec<(ProviderConfig, Arc<dyn Provider>)>,
        factory: ValidatorFactory,
        logger: Logger,
    ) -> Self {
        let units = providers
            .into_iter()
            .map(|(config, provider)| ProviderUnit { config, provider })
            .collect();
        Self::assemble(units, factory, logger)
    }

    fn assemble(units: Vec<ProviderUnit>, factory: ValidatorFactory, logger: Logger) -> Self {
        Self {
            units,
            factory: Arc::new(factory),
            limiters: Arc::new(RateLimiterPool::new()),
            logger,
            batches: Mutex::new(Vec::new()),
        }
    }

    /// Start a batch without blocking; the returned handle exposes the
    /// progress and message streams and yields [`Results`] on drain.
    ///
    /// Fails fast on configuration errors: every judge selector referenced
    /// by a task must resolve before anything is dispatched.
    pub fn start(
        &self,
        cancel: &CancellationToken,
        tasks: Vec<Task>,
    ) -> Result<ResultSet, ConfigError> {
        for task in &tasks {
            if task.rules.use_judge() {
                if let Some(selector) = &task.rules.judge {
                    self.factory.assert_exists(selector)?;
                }
            }
        }

        let batch_cancel = cancel.child_token();
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<(usize, usize, RunResult)>();
        let (done_tx, done_rx) = watch::channel(false);

        let batch_logger = self.logger.with_sink(Arc::new(ChannelSink::new(message_tx)));
        let tasks = Arc::new(tasks);

        // Enumerate scheduling units in provider order, run order.
        struct UnitPlan {
            provider_name: String,
            provider_index: usize,
            run: RunConfig,
            executor: Arc<TaskExecutor>,
        }
        let mut plans = Vec::new();
        for (provider_index, unit) in self.units.iter().enumerate() {
            for run in &unit.config.runs {
                let limiter = self.limiters.limiter(
                    &format!("{}#{}", unit.provider.name(), provider_index),
                    &run.model,
                    run.max_requests_per_minute,
                    unit.provider.max_concurrent_requests(),
                );
                plans.push(UnitPlan {
                    provider_name: unit.provider.name().to_string(),
                    provider_index,
                    run: run.clone(),
                    executor: Arc::new(TaskExecutor::new(
                        Arc::clone(&unit.provider),
                        run.clone(),
                        limiter,
                    )),
                });
            }
        }

        let unit_count = plans.len();
        let task_count = tasks.len();
        let total = unit_count * task_count;
        batch_logger.message(
            LogLevel::Info,
            format!(
                "starting batch: {} scheduling unit(s) x {} task(s)",
                unit_count, task_count
            ),
        );

        // Assembly map: unit index -> (provider index, provider name).
        let unit_providers: Vec<(usize, String)> = plans
            .iter()
            .map(|plan| (plan.provider_index, plan.provider_name.clone()))
            .collect();

        for (unit_index, plan) in plans.into_iter().enumerate() {
            let unit_logger = batch_logger
                .with_context(&format!("{}/{}", plan.provider_name, plan.run.name));
            let factory = Arc::clone(&self.factory);
            let tasks = Arc::clone(&tasks);
            let cancel = batch_cancel.clone();
            let result_tx = result_tx.clone();
            tokio::spawn(async move {
                for (task_index, task) in tasks.iter().enumerate() {
                    let record = if cancel.is_cancelled() {
                        cancelled_record(&plan.provider_name, &plan.run.name, task)
                    } else {
                        execute_and_validate(
                            &cancel,
                            &unit_logger,
                            &factory,
                            &plan.executor,
                            &plan.provider_name,
                            &plan.run.name,
                            task,
                        )
                        .await
                    };
                    if result_tx.send((unit_index, task_index, record)).is_err() {
                        return;
                    }
                }
            });
        }
        drop(result_tx);

        // Fan-in collector: the only writer of the final result slots.
        let provider_order: Vec<String> = {
            let mut seen = BTreeMap::new();
            let mut order = Vec::new();
            for (provider_index, name) in &unit_providers {
                if seen.insert(*provider_index, ()).is_none() {
                    order.push(name.clone());
                }
            }
            order
        };
        let collector_logger = batch_logger.clone();
        let collector: JoinHandle<Results> = tokio::spawn(async move {
            let mut slots: Vec<Vec<Option<RunResult>>> =
                vec![vec![None; task_count]; unit_count];
            let mut done = 0usize;
            while let Some((unit_index, task_index, record)) = result_rx.recv().await {
                slots[unit_index][task_index] = Some(record);
                done += 1;
                let _ = progress_tx.send(if total == 0 {
                    1.0
                } else {
                    done as f32 / total as f32
                });
            }

            let mut groups: Vec<ProviderResults> = provider_order
                .iter()
                .map(|name| ProviderResults {
                    provider: name.clone(),
                    records: Vec::new(),
                })
                .collect();
            for (unit_index, unit_slots) in slots.into_iter().enumerate() {
                let (provider_index, provider_name) = &unit_providers[unit_index];
                let group = groups
                    .get_mut(*provider_index)
                    .unwrap_or_else(|| unreachable!("unit without provider group"));
                debug_assert_eq!(&group.provider, provider_name);
                for record in unit_slots {
                    group.records.push(record.unwrap_or_else(|| RunResult {
                        trace_id: Uuid::new_v4(),
                        provider: provider_name.clone(),
                        run: String::new(),
                        task: String::new(),
                        kind: Kind::Error,
                        duration: Duration::ZERO,
                        want: crate::config::ValueSet::new(Vec::new()),
                        got: None,
                        details: Details {
                            answer: None,
                            validation: None,
                            error: Some(ErrorDetails {
                                title: "Scheduling Error".to_string(),
                                message: "the scheduling unit exited before recording a result"
                                    .to_string(),
                                diagnostics: BTreeMap::new(),
                                usage: Default::default(),
                            }),
                        },
                    }));
                }
            }
            collector_logger.message(LogLevel::Info, format!("batch finished: {} record(s)", done));
            drop(collector_logger);
            let _ = done_tx.send(true);
            Results::new(groups)
        });

        self.batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(done_rx);

        Ok(ResultSet {
            cancel: batch_cancel,
            progress: Some(progress_rx),
            messages: Some(message_rx),
            collector: Some(collector),
            snapshot: None,
        })
    }

    /// Blocking convenience: start the batch and drain it.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        tasks: Vec<Task>,
    ) -> Result<Results, ConfigError> {
        let mut set = self.start(cancel, tasks)?;
        Ok(set.results().await)
    }

    /// Shut down: wait for every started batch to finish recording, then
    /// close providers and the validator factory.
    pub async fn close(&self) {
        let receivers: Vec<watch::Receiver<bool>> = {
            let mut batches = self.batches.lock().unwrap_or_else(|e| e.into_inner());
            batches.drain(..).collect()
        };
        for mut done in receivers {
            while !*done.borrow() {
                if done.changed().await.is_err() {
                    break;
                }
            }
        }
        for unit in &self.units {
            unit.provider.close().await;
        }
        self.factory.close().await;
    }
}

/// Asynchronous handle to a running batch.
pub struct ResultSet {
    cancel: CancellationToken,
    progress: Option<mpsc::UnboundedReceiver<f32>>,
    messages: Option<mpsc::UnboundedReceiver<String>>,
    collector: Option<JoinHandle<Results>>,
    snapshot: Option<Results>,
}

impl ResultSet {
    /// The progress stream: one fraction in `(0, 1]` per recorded result.
    /// Closes exactly once when the batch finishes or is cancelled. Each
    /// stream can be taken once.
    pub fn progress_events(&mut self) -> Option<UnboundedReceiverStream<f32>> {
        self.progress.take().map(UnboundedReceiverStream::new)
    }

    /// The log message stream for human display; closes with the batch.
    pub fn message_events(&mut self) -> Option<UnboundedReceiverStream<String>> {
        self.messages.take().map(UnboundedReceiverStream::new)
    }

    /// Cancel the batch. In-flight work is recorded with a cancellation
    /// diagnostic; the total record count stays deterministic.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the batch to drain and return the ordered results.
    /// Idempotent: later calls return the same snapshot.
    pub async fn results(&mut self) -> Results {
        if self.snapshot.is_none() {
            let results = match self.collector.take() {
                Some(handle) => handle.await.unwrap_or_default(),
                None => Results::default(),
            };
            self.snapshot = Some(results);
        }
        self.snapshot.clone().unwrap_or_default()
    }
}

/// Execute one task in one unit and fold the validation stage into a record.
async fn execute_and_validate(
    cancel: &CancellationToken,
    logger: &Logger,
    factory: &ValidatorFactory,
    executor: &TaskExecutor,
    provider_name: &str,
    run_name: &str,
    task: &Task,
) -> RunResult {
    let executed = executor.execute(cancel, logger, task).await;
    let task_result = match executed {
        Ok(result) => result,
        Err(err) => return error_record(provider_name, run_name, task, *err),
    };

    let validator = match factory.validator(task.rules.judge.as_ref()).await {
        Ok(validator) => validator,
        Err(err) => {
            return validation_error_record(
                provider_name,
                run_name,
                task,
                &task_result,
                &err.to_string(),
                false,
            );
        }
    };

    let verdict = validator
        .is_correct(
            cancel,
            logger,
            &task.rules,
            &task.expected_result,
            &task_result,
            &task.prompt,
            &task.response_format,
        )
        .await;

    match verdict {
        Ok(validation) => success_or_failure_record(
            provider_name,
            run_name,
            task,
            &task_result,
            validation,
        ),
        Err(err) => {
            let cancelled = matches!(err, ValidationError::Cancelled);
            validation_error_record(
                provider_name,
                run_name,
                task,
                &task_result,
                &err.to_string(),
                cancelled,
            )
        }
    }
}

fn answer_details(result: &TaskResult) -> AnswerDetails {
    AnswerDetails {
        title: "Model Answer".to_string(),
        explanation: String::new(),
        system_prompt: result.prompts.system.clone(),
        user_prompt: result.prompts.user.clone(),
        actual_answer: result.raw_answer.clone(),
        usage: result.usage,
    }
}

fn success_or_failure_record(
    provider: &str,
    run: &str,
    task: &Task,
    result: &TaskResult,
    validation: ValidationResult,
) -> RunResult {
    let kind = if validation.is_correct {
        Kind::Success
    } else {
        Kind::Failure
    };
    RunResult {
        trace_id: result.trace_id,
        provider: provider.to_string(),
        run: run.to_string(),
        task: task.name.clone(),
        kind,
        duration: result.duration,
        want: task.expected_result.clone(),
        got: Some(result.final_answer.clone()),
        details: Details {
            answer: Some(answer_details(result)),
            validation: Some(ValidationDetails {
                title: validation.title,
                explanation: validation.explanation,
                usage: validation.usage,
            }),
            error: None,
        },
    }
}

fn error_record(provider: &str, run: &str, task: &Task, err: ExecuteError) -> RunResult {
    let kind = if err.not_supported {
        Kind::NotSupported
    } else {
        Kind::Error
    };
    RunResult {
        trace_id: err.trace_id,
        provider: provider.to_string(),
        run: run.to_string(),
        task: task.name.clone(),
        kind,
        duration: err.duration,
        want: task.expected_result.clone(),
        got: None,
        details: Details {
            answer: None,
            validation: None,
            error: Some(ErrorDetails {
                title: err.title,
                message: err.message,
                diagnostics: err.diagnostics,
                usage: err.usage,
            }),
        },
    }
}

fn validation_error_record(
    provider: &str,
    run: &str,
    task: &Task,
    result: &TaskResult,
    message: &str,
    cancelled: bool,
) -> RunResult {
    let mut diagnostics = BTreeMap::new();
    if cancelled {
        diagnostics.insert("cancelled".to_string(), "true".to_string());
    }
    RunResult {
        trace_id: result.trace_id,
        provider: provider.to_string(),
        run: run.to_string(),
        task: task.name.clone(),
        kind: Kind::Error,
        duration: result.duration,
        want: task.expected_result.clone(),
        got: Some(result.final_answer.clone()),
        details: Details {
            answer: Some(answer_details(result)),
            validation: None,
            error: Some(ErrorDetails {
                title: if cancelled {
                    "Cancelled".to_string()
                } else {
                    "Validation Error".to_string()
                },
                message: message.to_string(),
                diagnostics,
                usage: Default::default(),
            }),
        },
    }
}

fn cancelled_record(provider: &str, run: &str, task: &Task) -> RunResult {
    RunResult {
        trace_id: Uuid::new_v4(),
        provider: provider.to_string(),
        run: run.to_string(),
        task: task.name.clone(),
        kind: Kind::Error,
        duration: Duration::ZERO,
        want: task.expected_result.clone(),
        got: None,
        details: Details {
            answer: None,
            validation: None,
            error: Some(ErrorDetails {
                title: "Cancelled".to_string(),
                message: "the batch was cancelled before this task started".to_string(),
                diagnostics: BTreeMap::from([("cancelled".to_string(), "true".to_string())]),
                usage: Default::default(),
            }),
        },
    }
}
