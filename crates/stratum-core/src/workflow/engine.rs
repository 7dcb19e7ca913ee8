//! Workflow engine: dependency-driven step execution.
//!
//! The engine keeps a ready queue of steps whose dependencies have all
//! reached a terminal state and runs them on a `JoinSet`, up to
//! `EngineConfig::max_concurrency` at a time. As each step finishes, its
//! dependents are released into the ready queue.
//!
//! # Execution flow
//!
//! 1. Validate the graph; an invalid graph never runs.
//! 2. Queue every step without dependencies.
//! 3. For each ready step: evaluate its skip predicate, otherwise spawn it.
//!    A spawned step makes up to `retry_count + 1` attempts, each bounded by
//!    its timeout.
//! 4. Store completed outputs in the context and release dependents.
//! 5. A failed required step aborts the run: in-flight steps are torn down
//!    and reported as cancelled, queued steps never start.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use stratum_types::config::EngineConfig;
use stratum_types::error::{ConfigError, ErrorDetail, ErrorKind, HasErrorKind};
use stratum_types::event::RuntimeEvent;
use stratum_types::workflow::{
    StepErrorRecord, StepResult, StepStatus, ValidationReport, WorkflowMetrics, WorkflowOutcome,
};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::EventBus;

use super::context::WorkflowContext;
use super::dag::validate_steps;
use super::step::{Step, StepError};

// ---------------------------------------------------------------------------
// WorkflowError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// The graph failed validation; no step ran.
    #[error("workflow '{workflow}' is invalid: {}", .report.summary())]
    Invalid {
        workflow: String,
        report: ValidationReport,
    },

    /// A required step exhausted its attempts.
    #[error("step '{step_id}' failed: {error}")]
    StepFailed {
        step_id: String,
        error: ErrorDetail,
        outcome: Box<WorkflowOutcome>,
    },

    /// Steps remain but none can become ready.
    #[error("workflow deadlocked with unresolved steps: {}", .remaining.join(", "))]
    Deadlock {
        remaining: Vec<String>,
        outcome: Box<WorkflowOutcome>,
    },

    #[error("workflow timed out after {timeout:?}")]
    Timeout {
        timeout: Duration,
        outcome: Box<WorkflowOutcome>,
    },

    #[error("workflow cancelled")]
    Cancelled { outcome: Box<WorkflowOutcome> },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl WorkflowError {
    /// The partial outcome of an aborted run, if the run started.
    pub fn outcome(&self) -> Option<&WorkflowOutcome> {
        match self {
            Self::StepFailed { outcome, .. }
            | Self::Deadlock { outcome, .. }
            | Self::Timeout { outcome, .. }
            | Self::Cancelled { outcome } => Some(outcome),
            Self::Invalid { .. } | Self::Config(_) => None,
        }
    }
}

impl HasErrorKind for WorkflowError {
    fn error_kind(&self) -> ErrorKind {
        match self {
            Self::Invalid { .. } | Self::Config(_) => ErrorKind::Validation,
            Self::StepFailed { error, .. } => error.kind,
            Self::Deadlock { .. } => ErrorKind::Unexpected,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }
}

/// Why a run stopped early.
enum Abort {
    StepFailed { step_id: String, error: ErrorDetail },
    Deadlock(Vec<String>),
    Timeout(Duration),
    Cancelled,
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

struct RunState {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    clock: Instant,
    results: Vec<StepResult>,
}

impl RunState {
    fn is_resolved(&self, idx: usize) -> bool {
        self.results[idx].status.is_terminal()
    }

    /// Mark every step still running as torn down.
    fn cancel_in_flight(&mut self, reason: &str) {
        for result in &mut self.results {
            if result.status == StepStatus::InProgress {
                result.error = Some(ErrorDetail::new(ErrorKind::Cancelled, reason));
                result.finish(StepStatus::Cancelled);
            }
        }
    }

    fn outcome(&self, workflow_name: &str, success: bool, steps: &[Arc<Step>]) -> WorkflowOutcome {
        let elapsed_ms = self.clock.elapsed().as_millis() as u64;
        let errors = self
            .results
            .iter()
            .zip(steps)
            .filter(|(r, _)| r.status == StepStatus::Failed)
            .filter_map(|(r, s)| {
                r.error.clone().map(|error| StepErrorRecord {
                    step_id: r.step_id.clone(),
                    optional: s.is_optional(),
                    error,
                })
            })
            .collect();

        WorkflowOutcome {
            workflow_name: workflow_name.to_string(),
            run_id: self.run_id,
            success,
            started_at: self.started_at,
            finished_at: Utc::now(),
            metrics: WorkflowMetrics::from_results(&self.results, elapsed_ms),
            steps: self.results.clone(),
            errors,
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Runs a graph of [`Step`]s over a shared [`WorkflowContext`].
///
/// One engine can execute its graph any number of times; each `execute`
/// call is a separate run with its own run ID.
pub struct WorkflowEngine {
    name: String,
    steps: Vec<Arc<Step>>,
    /// Dependents of each step, by index.
    dependents: Vec<Vec<usize>>,
    /// Number of distinct known dependencies of each step.
    dependency_counts: Vec<usize>,
    config: EngineConfig,
    event_bus: Option<EventBus>,
    cancel: CancellationToken,
}

impl WorkflowEngine {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        let steps: Vec<Arc<Step>> = steps.into_iter().map(Arc::new).collect();

        let mut dependents = vec![Vec::new(); steps.len()];
        let mut dependency_counts = vec![0; steps.len()];
        for (idx, step) in steps.iter().enumerate() {
            for dep in step.dependencies() {
                if let Some(dep_idx) = steps.iter().position(|s| s.id() == dep) {
                    dependents[dep_idx].push(idx);
                    dependency_counts[idx] += 1;
                }
            }
        }

        Self {
            name: name.into(),
            steps,
            dependents,
            dependency_counts,
            config: EngineConfig::default(),
            event_bus: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().map(|s| s.as_ref())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Abort every current and future run of this engine.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Structural check of the graph. Never executes a step.
    pub fn validate(&self, ctx: &WorkflowContext) -> ValidationReport {
        validate_steps(&self.steps, ctx)
    }

    fn publish(&self, event: RuntimeEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }

    /// Run the graph to completion.
    ///
    /// Returns the outcome when every required step completed. Optional
    /// failures are listed in the outcome's `errors`. Any abort returns an
    /// error carrying the partial outcome.
    pub async fn execute(&self, ctx: &WorkflowContext) -> Result<WorkflowOutcome, WorkflowError> {
        self.config.validate()?;

        let report = self.validate(ctx);
        if !report.valid {
            tracing::warn!(
                workflow = self.name.as_str(),
                issues = report.issues.len(),
                "workflow validation failed"
            );
            return Err(WorkflowError::Invalid {
                workflow: self.name.clone(),
                report,
            });
        }

        let mut run = RunState {
            run_id: Uuid::now_v7(),
            started_at: Utc::now(),
            clock: Instant::now(),
            results: self
                .steps
                .iter()
                .map(|s| StepResult::not_started(s.id(), s.display_name()))
                .collect(),
        };
        let run_id = run.run_id;

        self.publish(RuntimeEvent::WorkflowRunStarted {
            run_id,
            workflow_name: self.name.clone(),
            total_steps: self.steps.len(),
        });
        tracing::info!(
            run_id = %run_id,
            workflow = self.name.as_str(),
            steps = self.steps.len(),
            "starting workflow execution"
        );

        let token = self.cancel.child_token();
        let scheduled = self.schedule(ctx, &mut run, &token);
        let result = match self.config.workflow_timeout() {
            Some(limit) => tokio::time::timeout(limit, scheduled)
                .await
                .unwrap_or(Err(Abort::Timeout(limit))),
            None => scheduled.await,
        };
        // Stops any step task that outlived the scheduler.
        token.cancel();

        match result {
            Ok(()) => {
                let outcome = run.outcome(&self.name, true, &self.steps);
                self.publish(RuntimeEvent::WorkflowRunCompleted {
                    run_id,
                    workflow_name: self.name.clone(),
                    duration_ms: outcome.metrics.total_duration_ms,
                    steps_completed: outcome.metrics.completed,
                    steps_failed: outcome.metrics.failed,
                });
                tracing::info!(
                    run_id = %run_id,
                    workflow = self.name.as_str(),
                    completed = outcome.metrics.completed,
                    failed = outcome.metrics.failed,
                    skipped = outcome.metrics.skipped,
                    duration_ms = outcome.metrics.total_duration_ms,
                    "workflow completed"
                );
                Ok(outcome)
            }
            Err(abort) => {
                let reason = match &abort {
                    Abort::StepFailed { step_id, .. } => format!("run aborted: step '{step_id}' failed"),
                    Abort::Deadlock(_) => "run aborted: deadlock".to_string(),
                    Abort::Timeout(_) => "run aborted: workflow timed out".to_string(),
                    Abort::Cancelled => "run aborted: cancelled".to_string(),
                };
                run.cancel_in_flight(&reason);
                let outcome = Box::new(run.outcome(&self.name, false, &self.steps));

                let err = match abort {
                    Abort::StepFailed { step_id, error } => WorkflowError::StepFailed {
                        step_id,
                        error,
                        outcome,
                    },
                    Abort::Deadlock(remaining) => WorkflowError::Deadlock { remaining, outcome },
                    Abort::Timeout(timeout) => WorkflowError::Timeout { timeout, outcome },
                    Abort::Cancelled => WorkflowError::Cancelled { outcome },
                };
                tracing::warn!(
                    run_id = %run_id,
                    workflow = self.name.as_str(),
                    error = %err,
                    "workflow failed"
                );
                self.publish(RuntimeEvent::WorkflowRunFailed {
                    run_id,
                    workflow_name: self.name.clone(),
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn schedule(
        &self,
        ctx: &WorkflowContext,
        run: &mut RunState,
        token: &CancellationToken,
    ) -> Result<(), Abort> {
        let mut waiting = self.dependency_counts.clone();
        let mut ready: VecDeque<usize> = (0..self.steps.len()).filter(|&i| waiting[i] == 0).collect();
        let mut join_set: JoinSet<(usize, StepResult)> = JoinSet::new();
        let max_concurrency = self.config.max_concurrency.max(1);

        loop {
            while join_set.len() < max_concurrency {
                let Some(idx) = ready.pop_front() else { break };
                let step = &self.steps[idx];

                if step.should_skip(ctx) {
                    tracing::debug!(run_id = %run.run_id, step_id = step.id(), "skipping step");
                    run.results[idx].finish(StepStatus::Skipped);
                    self.publish(RuntimeEvent::WorkflowStepSkipped {
                        run_id: run.run_id,
                        step_id: step.id().to_string(),
                    });
                    self.release(idx, &mut waiting, &mut ready);
                    continue;
                }

                let result = &mut run.results[idx];
                result.status = StepStatus::InProgress;
                result.started_at = Some(Utc::now());

                let task = StepTask {
                    run_id: run.run_id,
                    step: Arc::clone(step),
                    ctx: ctx.clone(),
                    result: result.clone(),
                    default_timeout: self.config.default_step_timeout(),
                    event_bus: self.event_bus.clone(),
                    token: token.clone(),
                };
                join_set.spawn(async move { (idx, task.run().await) });
            }

            if join_set.is_empty() {
                break;
            }

            let joined = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(Abort::Cancelled),
                joined = join_set.join_next() => joined,
            };
            let Some(joined) = joined else { break };
            let (idx, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    tracing::error!(run_id = %run.run_id, error = %e, "step task did not finish");
                    continue;
                }
            };

            let failed_required =
                result.status == StepStatus::Failed && !self.steps[idx].is_optional();
            let error = result.error.clone();
            run.results[idx] = result;

            if failed_required {
                join_set.abort_all();
                while let Some(joined) = join_set.join_next().await {
                    if let Ok((other, result)) = joined {
                        run.results[other] = result;
                    }
                }
                return Err(Abort::StepFailed {
                    step_id: self.steps[idx].id().to_string(),
                    error: error.unwrap_or_else(|| {
                        ErrorDetail::new(ErrorKind::Unexpected, "step failed without error detail")
                    }),
                });
            }

            self.release(idx, &mut waiting, &mut ready);
        }

        let remaining: Vec<String> = (0..self.steps.len())
            .filter(|&i| !run.is_resolved(i))
            .map(|i| self.steps[i].id().to_string())
            .collect();
        if remaining.is_empty() {
            Ok(())
        } else {
            Err(Abort::Deadlock(remaining))
        }
    }

    /// Release dependents of a step that just reached a terminal state.
    fn release(&self, idx: usize, waiting: &mut [usize], ready: &mut VecDeque<usize>) {
        for &dependent in &self.dependents[idx] {
            waiting[dependent] -= 1;
            if waiting[dependent] == 0 {
                ready.push_back(dependent);
            }
        }
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("name", &self.name)
            .field("steps", &self.steps.len())
            .field("config", &self.config)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Step task
// ---------------------------------------------------------------------------

/// Everything one spawned step needs, owned so the task is `'static`.
struct StepTask {
    run_id: Uuid,
    step: Arc<Step>,
    ctx: WorkflowContext,
    result: StepResult,
    default_timeout: Option<Duration>,
    event_bus: Option<EventBus>,
    token: CancellationToken,
}

impl StepTask {
    fn publish(&self, event: RuntimeEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }

    async fn run(self) -> StepResult {
        let mut fallback = self.result.clone();
        match AssertUnwindSafe(self.attempts()).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(step_id = fallback.step_id.as_str(), "step panicked");
                fallback.error = Some(ErrorDetail::new(ErrorKind::Unexpected, "step panicked"));
                fallback.finish(StepStatus::Failed);
                fallback
            }
        }
    }

    async fn attempts(mut self) -> StepResult {
        let step = Arc::clone(&self.step);
        let policy = *step.policy();
        let timeout = step.step_timeout().or(self.default_timeout);
        let clock = Instant::now();

        for attempt in 1..=policy.max_attempts() {
            self.result.attempts = attempt;
            self.publish(RuntimeEvent::WorkflowStepStarted {
                run_id: self.run_id,
                step_id: step.id().to_string(),
                step_name: step.display_name().to_string(),
                attempt,
            });
            tracing::debug!(run_id = %self.run_id, step_id = step.id(), attempt, "running step");

            let outcome = tokio::select! {
                biased;
                _ = self.token.cancelled() => Err(StepError::failed("run aborted")),
                outcome = run_attempt(&step, &self.ctx, timeout) => outcome,
            };
            if self.token.is_cancelled() {
                // The scheduler records cancelled steps itself.
                return self.result;
            }

            let err = match outcome.and_then(|value| {
                self.ctx.set_step_output(step.id(), value)?;
                Ok(())
            }) {
                Ok(()) => {
                    self.result.output = self.ctx.step_output(step.id());
                    self.result.error = None;
                    self.result.finish(StepStatus::Completed);
                    let duration_ms = clock.elapsed().as_millis() as u64;
                    self.result.duration_ms = Some(duration_ms);
                    self.publish(RuntimeEvent::WorkflowStepCompleted {
                        run_id: self.run_id,
                        step_id: step.id().to_string(),
                        duration_ms,
                    });
                    tracing::debug!(run_id = %self.run_id, step_id = step.id(), duration_ms, "step completed");
                    return self.result;
                }
                Err(err) => err,
            };

            let detail = ErrorDetail::from_error(&err);
            let will_retry = policy.should_retry(attempt);
            tracing::warn!(
                run_id = %self.run_id,
                step_id = step.id(),
                attempt,
                will_retry,
                error = %err,
                "step attempt failed"
            );
            self.publish(RuntimeEvent::WorkflowStepFailed {
                run_id: self.run_id,
                step_id: step.id().to_string(),
                error: detail.to_string(),
                will_retry,
            });
            self.result.attempt_errors.push(detail.clone());
            self.result.error = Some(detail);

            if will_retry {
                tokio::select! {
                    _ = self.token.cancelled() => return self.result,
                    _ = tokio::time::sleep(policy.delay_for_attempt(attempt)) => {}
                }
            }
        }

        self.result.finish(StepStatus::Failed);
        self.result.duration_ms = Some(clock.elapsed().as_millis() as u64);
        self.result
    }
}

async fn run_attempt(
    step: &Step,
    ctx: &WorkflowContext,
    timeout: Option<Duration>,
) -> Result<serde_json::Value, StepError> {
    let attempt = step.handler().run_boxed(ctx);
    match timeout {
        Some(limit) => tokio::time::timeout(limit, attempt)
            .await
            .unwrap_or(Err(StepError::Timeout(limit))),
        None => attempt.await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;
    use stratum_types::error::AdapterError;
    use stratum_types::workflow::ValidationIssueKind;

    use super::*;
    use crate::workflow::retry::RetryPolicy;

    fn ok_step(id: &str, deps: &[&str]) -> Step {
        let owned = id.to_string();
        Step::from_fn(id, move |_ctx| {
            let id = owned.clone();
            async move { Ok(json!(format!("{id}-done"))) }
        })
        .depends_on(deps.iter().copied())
    }

    fn failing_step(id: &str, deps: &[&str]) -> Step {
        Step::from_fn(id, |_ctx| async {
            Err(StepError::from(AdapterError::api("backend rejected request")))
        })
        .depends_on(deps.iter().copied())
    }

    fn sleeping_step(id: &str, ms: u64) -> Step {
        Step::from_fn(id, move |_ctx| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!(ms))
        })
    }

    #[tokio::test]
    async fn test_runs_in_dependency_order_and_stores_outputs() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let recorded = |id: &'static str, deps: &[&str]| {
            let order = Arc::clone(&order);
            Step::from_fn(id, move |_ctx| {
                let order = Arc::clone(&order);
                async move {
                    order.lock().unwrap().push(id);
                    Ok(json!(id))
                }
            })
            .depends_on(deps.iter().copied())
        };

        let engine = WorkflowEngine::new(
            "diamond",
            vec![
                recorded("report", &["copy", "verify"]),
                recorded("copy", &["list"]),
                recorded("verify", &["list"]),
                recorded("list", &[]),
            ],
        );
        let ctx = WorkflowContext::new();
        let outcome = engine.execute(&ctx).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.metrics.completed, 4);
        assert!(outcome.errors.is_empty());
        // Declaration order in the outcome.
        let ids: Vec<&str> = outcome.steps.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(ids, vec!["report", "copy", "verify", "list"]);

        let order = order.lock().unwrap();
        assert_eq!(order.first(), Some(&"list"));
        assert_eq!(order.last(), Some(&"report"));
        assert_eq!(ctx.step_output("copy"), Some(json!("copy")));
    }

    #[tokio::test]
    async fn test_every_step_starts_after_its_dependencies_finish() {
        let edges = [
            ("copy", "list"),
            ("verify", "list"),
            ("report", "copy"),
            ("report", "verify"),
            ("cleanup", "report"),
        ];
        let engine = WorkflowEngine::new(
            "edges",
            vec![
                sleeping_step("cleanup", 1).depends_on(["report"]),
                sleeping_step("report", 2).depends_on(["copy", "verify"]),
                sleeping_step("verify", 3).depends_on(["list"]),
                sleeping_step("copy", 8).depends_on(["list"]),
                sleeping_step("list", 5),
                sleeping_step("audit", 4),
            ],
        );
        let outcome = engine.execute(&WorkflowContext::new()).await.unwrap();
        assert_eq!(outcome.metrics.completed, 6);

        for (step_id, dep) in edges {
            let started = outcome.step(step_id).unwrap().started_at.unwrap();
            let dep_finished = outcome.step(dep).unwrap().finished_at.unwrap();
            assert!(
                started >= dep_finished,
                "{step_id} started before {dep} finished"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_required_failure_leaves_optional_dependent_unstarted() {
        let engine = WorkflowEngine::new(
            "abort-chain",
            vec![
                ok_step("a", &[]),
                failing_step("b", &["a"]),
                ok_step("c", &["b"]).optional(),
            ],
        );

        let started = Instant::now();
        let err = engine.execute(&WorkflowContext::new()).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(1));

        let WorkflowError::StepFailed { step_id, error, outcome } = err else {
            panic!("expected step failure");
        };
        assert_eq!(step_id, "b");
        assert_eq!(error.kind, ErrorKind::Api);
        assert!(!outcome.success);
        assert_eq!(outcome.step("a").unwrap().status, StepStatus::Completed);
        assert_eq!(outcome.step("b").unwrap().status, StepStatus::Failed);
        let c = outcome.step("c").unwrap();
        assert_eq!(c.status, StepStatus::NotStarted);
        assert!(c.started_at.is_none());
    }

    #[tokio::test]
    async fn test_cycle_never_runs_any_step() {
        let ran = Arc::new(AtomicU32::new(0));
        let counting = |id: &str, dep: &str| {
            let ran = Arc::clone(&ran);
            Step::from_fn(id, move |_ctx| {
                ran.fetch_add(1, Ordering::SeqCst);
                async { Ok(json!(null)) }
            })
            .depends_on([dep])
        };

        let engine = WorkflowEngine::new("cyclic", vec![counting("a", "b"), counting("b", "a")]);
        let err = engine.execute(&WorkflowContext::new()).await.unwrap_err();

        match &err {
            WorkflowError::Invalid { report, .. } => {
                assert!(report.has_issue(ValidationIssueKind::Cycle));
                assert_eq!(report.cycles.len(), 1);
            }
            other => panic!("expected invalid, got {other}"),
        }
        assert_eq!(err.error_kind(), ErrorKind::Validation);
        assert!(err.outcome().is_none());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        let flaky = Step::from_fn("flaky", move |_ctx| {
            let n = seen.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(StepError::from(AdapterError::Connection("reset".into())))
                } else {
                    Ok(json!("ok"))
                }
            }
        })
        .retry_policy(RetryPolicy::exponential(3, Duration::from_millis(100), 2.0));

        let engine = WorkflowEngine::new("retry", vec![flaky]);
        let outcome = engine.execute(&WorkflowContext::new()).await.unwrap();

        let result = outcome.step("flaky").unwrap();
        assert_eq!(result.status, StepStatus::Completed);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.attempt_errors.len(), 2);
        assert_eq!(result.attempt_errors[0].kind, ErrorKind::Connection);
        // 100ms + 200ms of backoff.
        assert!(result.duration_ms.unwrap() >= 300);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failed_attempt() {
        let slow = sleeping_step("slow", 1_000)
            .timeout(Duration::from_millis(50))
            .retries(1, Duration::from_millis(10));
        let engine = WorkflowEngine::new("timeouts", vec![slow]);

        let err = engine.execute(&WorkflowContext::new()).await.unwrap_err();
        let WorkflowError::StepFailed { step_id, error, outcome } = err else {
            panic!("expected step failure");
        };
        assert_eq!(step_id, "slow");
        assert_eq!(error.kind, ErrorKind::Timeout);
        assert_eq!(outcome.step("slow").unwrap().attempts, 2);
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn test_optional_failure_does_not_abort() {
        let engine = WorkflowEngine::new(
            "optional",
            vec![
                failing_step("audit", &[]).optional(),
                ok_step("copy", &["audit"]),
            ],
        );
        let outcome = engine.execute(&WorkflowContext::new()).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.step("audit").unwrap().status, StepStatus::Failed);
        assert_eq!(outcome.step("copy").unwrap().status, StepStatus::Completed);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].optional);
        assert_eq!(outcome.errors[0].error.kind, ErrorKind::Api);
    }

    #[tokio::test(start_paused = true)]
    async fn test_required_failure_cancels_in_flight_and_queued() {
        let engine = WorkflowEngine::new(
            "abort",
            vec![
                sleeping_step("long", 10_000),
                Step::from_fn("bad", |_ctx| async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Err(StepError::failed("disk full"))
                }),
                ok_step("after", &["bad"]),
            ],
        );

        let err = engine.execute(&WorkflowContext::new()).await.unwrap_err();
        let outcome = err.outcome().unwrap();
        assert_eq!(outcome.step("bad").unwrap().status, StepStatus::Failed);
        assert_eq!(outcome.step("long").unwrap().status, StepStatus::Cancelled);
        assert_eq!(outcome.step("after").unwrap().status, StepStatus::NotStarted);
        assert_eq!(outcome.metrics.cancelled, 1);
        assert!(err.to_string().contains("disk full"));
    }

    #[tokio::test]
    async fn test_skip_predicate_releases_dependents() {
        let engine = WorkflowEngine::new(
            "skips",
            vec![
                ok_step("backup", &[]).skip_if(|ctx| ctx.variable("skip_backup").is_some()),
                ok_step("migrate", &["backup"]),
            ],
        );
        let ctx = WorkflowContext::with_variables([("skip_backup", json!(true))]);
        let outcome = engine.execute(&ctx).await.unwrap();

        assert_eq!(outcome.step("backup").unwrap().status, StepStatus::Skipped);
        assert_eq!(outcome.step("migrate").unwrap().status, StepStatus::Completed);
        assert_eq!(outcome.metrics.skipped, 1);
        assert!(!ctx.has_step_output("backup"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_limit() {
        let running = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let steps = (0..6)
            .map(|i| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                Step::from_fn(format!("s{i}"), move |_ctx| {
                    let running = Arc::clone(&running);
                    let peak = Arc::clone(&peak);
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(json!(i))
                    }
                })
            })
            .collect();

        let engine = WorkflowEngine::new("bounded", steps).with_config(EngineConfig {
            max_concurrency: 2,
            ..Default::default()
        });
        let outcome = engine.execute(&WorkflowContext::new()).await.unwrap();
        assert_eq!(outcome.metrics.completed, 6);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_workflow_timeout() {
        let engine = WorkflowEngine::new("slow", vec![sleeping_step("wait", 5_000)]).with_config(
            EngineConfig {
                workflow_timeout_ms: Some(100),
                ..Default::default()
            },
        );
        let err = engine.execute(&WorkflowContext::new()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Timeout { .. }));
        assert_eq!(err.error_kind(), ErrorKind::Timeout);
        assert_eq!(
            err.outcome().unwrap().step("wait").unwrap().status,
            StepStatus::Cancelled
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_cancel() {
        let engine = Arc::new(WorkflowEngine::new("cancel", vec![sleeping_step("wait", 5_000)]));
        let runner = Arc::clone(&engine);
        let handle = tokio::spawn(async move { runner.execute(&WorkflowContext::new()).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, WorkflowError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_events_published() {
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let engine = WorkflowEngine::new("events", vec![ok_step("only", &[])]).with_event_bus(bus);
        engine.execute(&WorkflowContext::new()).await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(serde_json::to_value(&event).unwrap()["type"].as_str().unwrap().to_string());
        }
        assert_eq!(
            kinds,
            vec![
                "workflow_run_started",
                "workflow_step_started",
                "workflow_step_completed",
                "workflow_run_completed",
            ]
        );
    }

    #[tokio::test]
    async fn test_validate_does_not_execute() {
        let ran = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&ran);
        let engine = WorkflowEngine::new(
            "dry",
            vec![Step::from_fn("a", move |_ctx| {
                seen.fetch_add(1, Ordering::SeqCst);
                async { Ok(json!(null)) }
            })],
        );
        let report = engine.validate(&WorkflowContext::new());
        assert!(report.valid);
        assert_eq!(report.step_count, 1);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
