//! Composite step running several handlers concurrently.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::{Map, Value};
use stratum_types::error::ErrorDetail;
use tokio::task::JoinSet;

use super::context::WorkflowContext;
use super::step::{StepError, StepHandler, StepHandlerDyn};

/// Runs its children in parallel and returns their outputs as one JSON
/// object keyed by child ID.
///
/// Without fail-fast every child runs to completion and all failures are
/// reported together. With fail-fast the first failure tears down the
/// children still running; they are reported as cancelled.
#[derive(Clone, Default)]
pub struct ParallelGroup {
    children: Vec<(String, Arc<dyn StepHandlerDyn>)>,
    fail_fast: bool,
}

impl ParallelGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(mut self, id: impl Into<String>, handler: impl StepHandler) -> Self {
        self.children.push((id.into(), Arc::new(handler)));
        self
    }

    pub fn fail_fast(mut self) -> Self {
        self.fail_fast = true;
        self
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

impl StepHandler for ParallelGroup {
    async fn run(&self, ctx: &WorkflowContext) -> Result<Value, StepError> {
        let mut join_set = JoinSet::new();
        let mut task_ids = HashMap::new();
        for (id, handler) in &self.children {
            let handler = Arc::clone(handler);
            let ctx = ctx.clone();
            let child_id = id.clone();
            let task = join_set.spawn(async move {
                let result = handler.run_boxed(&ctx).await;
                (child_id, result)
            });
            task_ids.insert(task.id(), id.clone());
        }

        let mut pending: BTreeSet<String> = self.children.iter().map(|(id, _)| id.clone()).collect();
        let mut outputs = Map::new();
        let mut failed = Vec::new();
        let mut first_error = None;

        while let Some(joined) = join_set.join_next_with_id().await {
            let (id, result) = match joined {
                Ok((_, finished)) => finished,
                Err(err) if err.is_panic() => {
                    let Some(id) = task_ids.get(&err.id()).cloned() else {
                        continue;
                    };
                    tracing::error!(child = id.as_str(), "grouped step panicked");
                    (id, Err(StepError::failed("grouped step panicked")))
                }
                // Aborted by fail-fast; stays pending and is reported cancelled.
                Err(_) => continue,
            };
            pending.remove(&id);
            match result {
                Ok(value) => {
                    outputs.insert(id, value);
                }
                Err(err) => {
                    tracing::debug!(child = id.as_str(), error = %err, "grouped step failed");
                    first_error.get_or_insert_with(|| ErrorDetail::from_error(&err));
                    failed.push(id);
                    if self.fail_fast {
                        join_set.abort_all();
                    }
                }
            }
        }

        match first_error {
            None => Ok(Value::Object(outputs)),
            Some(first_error) => Err(StepError::Group {
                total: self.children.len(),
                failed,
                cancelled: pending.into_iter().collect(),
                first_error,
            }),
        }
    }

    fn validate(&self, ctx: &WorkflowContext) -> Result<(), String> {
        if self.children.is_empty() {
            return Err("parallel group has no children".to_string());
        }
        let mut seen = BTreeSet::new();
        for (id, handler) in &self.children {
            if !seen.insert(id.as_str()) {
                return Err(format!("duplicate child ID '{id}'"));
            }
            handler
                .validate_dyn(ctx)
                .map_err(|reason| format!("child '{id}': {reason}"))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ParallelGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<&str> = self.children.iter().map(|(id, _)| id.as_str()).collect();
        f.debug_struct("ParallelGroup")
            .field("children", &ids)
            .field("fail_fast", &self.fail_fast)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use stratum_types::error::{AdapterError, ErrorKind, HasErrorKind};

    use super::*;

    /// Sleeps, then returns `output` or fails when it is `None`.
    struct Child {
        delay_ms: u64,
        output: Option<Value>,
    }

    fn ok(delay_ms: u64, output: Value) -> Child {
        Child {
            delay_ms,
            output: Some(output),
        }
    }

    fn fail(delay_ms: u64) -> Child {
        Child {
            delay_ms,
            output: None,
        }
    }

    impl StepHandler for Child {
        async fn run(&self, _ctx: &WorkflowContext) -> Result<Value, StepError> {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            self.output
                .clone()
                .ok_or_else(|| AdapterError::ResourceExhausted("quota".into()).into())
        }
    }

    #[tokio::test]
    async fn test_collects_child_outputs() {
        let group = ParallelGroup::new()
            .child("secrets", ok(0, json!(3)))
            .child("buckets", ok(0, json!(5)));
        let out = group.run(&WorkflowContext::new()).await.unwrap();
        assert_eq!(out, json!({ "secrets": 3, "buckets": 5 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_fail_fast_all_children_finish() {
        let group = ParallelGroup::new()
            .child("bad", fail(10))
            .child("slow", ok(1_000, json!("done")));
        let err = group.run(&WorkflowContext::new()).await.unwrap_err();
        let StepError::Group { failed, cancelled, total, .. } = &err else {
            panic!("expected group error");
        };
        assert_eq!(*total, 2);
        assert_eq!(failed, &vec!["bad".to_string()]);
        assert!(cancelled.is_empty());
        assert_eq!(err.error_kind(), ErrorKind::ResourceExhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_fast_reports_siblings_cancelled() {
        let group = ParallelGroup::new()
            .child("bad", fail(10))
            .child("slow", ok(1_000, json!("done")))
            .child("quick", ok(0, json!(1)))
            .fail_fast();
        let err = group.run(&WorkflowContext::new()).await.unwrap_err();
        let StepError::Group { failed, cancelled, .. } = err else {
            panic!("expected group error");
        };
        assert_eq!(failed, vec!["bad".to_string()]);
        assert_eq!(cancelled, vec!["slow".to_string()]);
    }

    struct Panics;

    impl StepHandler for Panics {
        async fn run(&self, _ctx: &WorkflowContext) -> Result<Value, StepError> {
            panic!("listing page out of range");
        }
    }

    #[tokio::test]
    async fn test_panicking_child_fails_the_group() {
        let group = ParallelGroup::new()
            .child("secrets", ok(0, json!(1)))
            .child("buckets", Panics);
        let err = group.run(&WorkflowContext::new()).await.unwrap_err();
        assert_eq!(err.error_kind(), ErrorKind::Unexpected);
        let StepError::Group { failed, cancelled, first_error, .. } = err else {
            panic!("expected group error");
        };
        assert_eq!(failed, vec!["buckets".to_string()]);
        assert!(cancelled.is_empty());
        assert!(first_error.message.contains("panicked"));
    }

    #[test]
    fn test_validate_rejects_empty_and_duplicates() {
        let ctx = WorkflowContext::new();
        assert!(ParallelGroup::new().validate(&ctx).is_err());

        let dup = ParallelGroup::new()
            .child("a", ok(0, json!(1)))
            .child("a", ok(0, json!(2)));
        assert_eq!(dup.validate(&ctx).unwrap_err(), "duplicate child ID 'a'");
    }
}
