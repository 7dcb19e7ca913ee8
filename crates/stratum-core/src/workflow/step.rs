//! Step definitions and the handler trait steps run.
//!
//! `StepHandler` follows the same RPITIT + blanket `*Dyn` pattern as the
//! cache tiers, so handlers are written with plain `async fn` while the
//! engine stores them as `Arc<dyn StepHandlerDyn>`.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use stratum_types::error::{AdapterError, ErrorDetail, ErrorKind, HasErrorKind};

use crate::batch::BatchError;
use crate::cache::CacheError;
use crate::resilience::ClientError;

use super::context::{ContextError, WorkflowContext};
use super::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Failure of one step attempt.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Context(#[from] ContextError),

    /// The step rejected its input.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("step timed out after {0:?}")]
    Timeout(Duration),

    /// One or more children of a grouped step failed.
    #[error("{} of {total} grouped steps failed: {}", .failed.len(), .failed.join(", "))]
    Group {
        total: usize,
        failed: Vec<String>,
        /// Children torn down by fail-fast before they finished.
        cancelled: Vec<String>,
        first_error: ErrorDetail,
    },

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StepError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl HasErrorKind for StepError {
    fn error_kind(&self) -> ErrorKind {
        match self {
            Self::Adapter(e) => e.error_kind(),
            Self::Client(e) => e.error_kind(),
            Self::Batch(e) => e.error_kind(),
            Self::Cache(e) => e.error_kind(),
            Self::Context(e) => e.error_kind(),
            Self::Validation(_) => ErrorKind::Validation,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Group { first_error, .. } => first_error.kind,
            Self::Failed(_) | Self::Other(_) => ErrorKind::Unexpected,
        }
    }
}

// ---------------------------------------------------------------------------
// StepHandler
// ---------------------------------------------------------------------------

/// The work a step performs.
///
/// The returned value becomes the step's output and is stored in the
/// context under `steps.<id>.output`.
pub trait StepHandler: Send + Sync + 'static {
    fn run(&self, ctx: &WorkflowContext) -> impl Future<Output = Result<Value, StepError>> + Send;

    /// Structural check run by `WorkflowEngine::validate`. Must not perform
    /// the step's work.
    fn validate(&self, _ctx: &WorkflowContext) -> Result<(), String> {
        Ok(())
    }
}

pub(crate) type StepFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, StepError>> + Send + 'a>>;

/// Object-safe version of [`StepHandler`].
pub trait StepHandlerDyn: Send + Sync {
    fn run_boxed<'a>(&'a self, ctx: &'a WorkflowContext) -> StepFuture<'a>;
    fn validate_dyn(&self, ctx: &WorkflowContext) -> Result<(), String>;
}

impl<T: StepHandler> StepHandlerDyn for T {
    fn run_boxed<'a>(&'a self, ctx: &'a WorkflowContext) -> StepFuture<'a> {
        Box::pin(self.run(ctx))
    }

    fn validate_dyn(&self, ctx: &WorkflowContext) -> Result<(), String> {
        self.validate(ctx)
    }
}

/// Adapts an async closure into a [`StepHandler`]. The closure receives an
/// owned clone of the context.
pub struct FnStep<F> {
    f: F,
}

impl<F> FnStep<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F, Fut> StepHandler for FnStep<F>
where
    F: Fn(WorkflowContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
{
    fn run(&self, ctx: &WorkflowContext) -> impl Future<Output = Result<Value, StepError>> + Send {
        (self.f)(ctx.clone())
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// Predicate deciding whether a step is skipped.
pub type SkipPredicate = Arc<dyn Fn(&WorkflowContext) -> bool + Send + Sync>;

/// One node of a workflow graph.
///
/// Built with chained setters before the graph is handed to the engine;
/// immutable afterwards.
#[derive(Clone)]
pub struct Step {
    id: String,
    name: String,
    depends_on: Vec<String>,
    timeout: Option<Duration>,
    retry: RetryPolicy,
    optional: bool,
    skip_if: Option<SkipPredicate>,
    handler: Arc<dyn StepHandlerDyn>,
}

impl Step {
    pub fn new(id: impl Into<String>, handler: impl StepHandler) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            depends_on: Vec::new(),
            timeout: None,
            retry: RetryPolicy::none(),
            optional: false,
            skip_if: None,
            handler: Arc::new(handler),
        }
    }

    /// Step backed by an async closure.
    pub fn from_fn<F, Fut>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(WorkflowContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
    {
        Self::new(id, FnStep::new(f))
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add dependencies. Repeated IDs are kept once, in first-seen order.
    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for id in ids {
            let id = id.into();
            if !self.depends_on.contains(&id) {
                self.depends_on.push(id);
            }
        }
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Fixed-delay retries.
    pub fn retries(mut self, retry_count: u32, retry_delay: Duration) -> Self {
        self.retry = RetryPolicy::fixed(retry_count, retry_delay);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// A failure of an optional step is recorded but does not abort the run.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn skip_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&WorkflowContext) -> bool + Send + Sync + 'static,
    {
        self.skip_if = Some(Arc::new(predicate));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn display_name(&self) -> &str {
        &self.name
    }

    pub fn dependencies(&self) -> &[String] {
        &self.depends_on
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }

    pub fn should_skip(&self, ctx: &WorkflowContext) -> bool {
        self.skip_if.as_ref().is_some_and(|p| p(ctx))
    }

    pub fn handler(&self) -> &dyn StepHandlerDyn {
        self.handler.as_ref()
    }

    pub(crate) fn shared_handler(&self) -> Arc<dyn StepHandlerDyn> {
        Arc::clone(&self.handler)
    }
}

impl AsRef<Step> for Step {
    fn as_ref(&self) -> &Step {
        self
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("optional", &self.optional)
            .field("skip_if", &self.skip_if.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    impl StepHandler for Echo {
        async fn run(&self, ctx: &WorkflowContext) -> Result<Value, StepError> {
            Ok(ctx.variable("input").unwrap_or(Value::Null))
        }

        fn validate(&self, ctx: &WorkflowContext) -> Result<(), String> {
            if ctx.variable("input").is_some() {
                Ok(())
            } else {
                Err("missing 'input' variable".to_string())
            }
        }
    }

    #[test]
    fn test_builder_dedups_dependencies() {
        let step = Step::new("copy", Echo)
            .name("Copy secrets")
            .depends_on(["list", "auth"])
            .depends_on(["list"])
            .timeout(Duration::from_secs(5))
            .retries(2, Duration::from_millis(10))
            .optional();

        assert_eq!(step.id(), "copy");
        assert_eq!(step.display_name(), "Copy secrets");
        assert_eq!(step.dependencies(), ["list", "auth"]);
        assert_eq!(step.step_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(step.policy().max_attempts(), 3);
        assert!(step.is_optional());
    }

    #[tokio::test]
    async fn test_handler_through_dyn() {
        let ctx = WorkflowContext::new();
        let step = Step::new("echo", Echo);
        assert!(step.handler().validate_dyn(&ctx).is_err());

        ctx.set_variable("input", json!("hello"));
        assert!(step.handler().validate_dyn(&ctx).is_ok());
        let out = step.handler().run_boxed(&ctx).await.unwrap();
        assert_eq!(out, json!("hello"));
    }

    #[tokio::test]
    async fn test_fn_step_and_skip_predicate() {
        let step = Step::from_fn("count", |ctx: WorkflowContext| async move {
            let n = ctx.variable("n").and_then(|v| v.as_u64()).unwrap_or(0);
            Ok(json!(n + 1))
        })
        .skip_if(|ctx| ctx.variable("dry_run").is_some());

        let ctx = WorkflowContext::with_variables([("n", json!(41))]);
        assert!(!step.should_skip(&ctx));
        assert_eq!(step.handler().run_boxed(&ctx).await.unwrap(), json!(42));

        ctx.set_variable("dry_run", json!(true));
        assert!(step.should_skip(&ctx));
    }

    #[test]
    fn test_step_error_kinds() {
        let err = StepError::from(AdapterError::Timeout("copy".into()));
        assert_eq!(err.error_kind(), ErrorKind::Timeout);
        assert_eq!(err.to_string(), "operation timed out: copy");

        let err = StepError::from(anyhow::anyhow!("boom"));
        assert_eq!(err.error_kind(), ErrorKind::Unexpected);

        let err = StepError::Group {
            total: 3,
            failed: vec!["a".into(), "b".into()],
            cancelled: vec![],
            first_error: ErrorDetail::new(ErrorKind::Api, "throttled"),
        };
        assert_eq!(err.error_kind(), ErrorKind::Api);
        assert_eq!(err.to_string(), "2 of 3 grouped steps failed: a, b");
    }
}
