//! Shared run context with step output tracking and template resolution.
//!
//! A `WorkflowContext` is a cheap, cloneable handle: every step of a run gets
//! a clone pointing at the same data. Writes go through a short
//! `RwLock` critical section, so steps that are not ordered by dependencies
//! must not write the same field.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::{Map, Value, json};
use stratum_types::error::{ErrorKind, HasErrorKind};

/// Maximum serialized size of a single step output (1 MiB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

/// Maximum serialized size of the whole context (10 MiB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("context size {size} bytes exceeds maximum {max} bytes")]
    TooLarge { size: usize, max: usize },
}

impl HasErrorKind for ContextError {
    fn error_kind(&self) -> ErrorKind {
        ErrorKind::ResourceExhausted
    }
}

#[derive(Debug, Default)]
struct ContextData {
    step_outputs: BTreeMap<String, Value>,
    variables: BTreeMap<String, Value>,
    /// Per-resource progress, e.g. `"secret/db-password" -> "migrated"`.
    resources: BTreeMap<String, String>,
}

impl ContextData {
    fn total_size(&self) -> usize {
        let values = self
            .step_outputs
            .values()
            .chain(self.variables.values())
            .map(serialized_len)
            .sum::<usize>();
        let resources = self
            .resources
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum::<usize>();
        values + resources
    }
}

/// Mutable state shared by every step of a workflow run.
#[derive(Clone, Default)]
pub struct WorkflowContext {
    data: Arc<RwLock<ContextData>>,
}

impl WorkflowContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a context pre-populated with variables.
    pub fn with_variables<I, K>(variables: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let ctx = Self::new();
        {
            let mut data = ctx.write();
            for (key, value) in variables {
                data.variables.insert(key.into(), value);
            }
        }
        ctx
    }

    fn read(&self) -> RwLockReadGuard<'_, ContextData> {
        self.data.read().expect("workflow context lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, ContextData> {
        self.data.write().expect("workflow context lock poisoned")
    }

    // -- variables ----------------------------------------------------------

    pub fn set_variable(&self, key: impl Into<String>, value: Value) {
        self.write().variables.insert(key.into(), value);
    }

    pub fn variable(&self, key: &str) -> Option<Value> {
        self.read().variables.get(key).cloned()
    }

    /// Variable as a string, if it is one.
    pub fn variable_str(&self, key: &str) -> Option<String> {
        self.read()
            .variables
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn remove_variable(&self, key: &str) -> Option<Value> {
        self.write().variables.remove(key)
    }

    // -- step outputs -------------------------------------------------------

    /// Store a step's output.
    ///
    /// Outputs larger than [`MAX_STEP_OUTPUT_SIZE`] are replaced with a
    /// truncation marker. Fails if the context would exceed
    /// [`MAX_CONTEXT_SIZE`]; the previous output (if any) is then kept.
    pub fn set_step_output(&self, step_id: &str, output: Value) -> Result<(), ContextError> {
        let size = serialized_len(&output);
        let output = if size > MAX_STEP_OUTPUT_SIZE {
            tracing::warn!(
                step_id,
                size,
                max = MAX_STEP_OUTPUT_SIZE,
                "step output exceeds size limit, truncating"
            );
            json!({
                "_truncated": true,
                "_original_size": size,
                "_message": format!("output truncated: {size} bytes exceeds {MAX_STEP_OUTPUT_SIZE} byte limit"),
            })
        } else {
            output
        };

        let mut data = self.write();
        let previous = data.step_outputs.insert(step_id.to_string(), output);
        let total = data.total_size();
        if total > MAX_CONTEXT_SIZE {
            match previous {
                Some(prev) => data.step_outputs.insert(step_id.to_string(), prev),
                None => data.step_outputs.remove(step_id),
            };
            return Err(ContextError::TooLarge {
                size: total,
                max: MAX_CONTEXT_SIZE,
            });
        }
        Ok(())
    }

    pub fn step_output(&self, step_id: &str) -> Option<Value> {
        self.read().step_outputs.get(step_id).cloned()
    }

    pub fn has_step_output(&self, step_id: &str) -> bool {
        self.read().step_outputs.contains_key(step_id)
    }

    // -- resource status ----------------------------------------------------

    pub fn set_resource_status(&self, resource: impl Into<String>, status: impl Into<String>) {
        self.write().resources.insert(resource.into(), status.into());
    }

    pub fn resource_status(&self, resource: &str) -> Option<String> {
        self.read().resources.get(resource).cloned()
    }

    /// All tracked resources with their status, sorted by name.
    pub fn resource_statuses(&self) -> BTreeMap<String, String> {
        self.read().resources.clone()
    }

    // -- templates ----------------------------------------------------------

    /// Resolve `{{ steps.<id>.output }}`, `{{ variables.<name> }}` and
    /// `{{ resources.<name> }}` references in `template`.
    ///
    /// Unknown references are left as-is.
    pub fn resolve_template(&self, template: &str) -> String {
        let data = self.read();
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            let Some(len) = rest[start..].find("}}") else {
                break;
            };
            let end = start + len + 2;
            out.push_str(&rest[..start]);

            let expr = rest[start + 2..end - 2].trim();
            match lookup(&data, expr) {
                Some(value) => out.push_str(&value),
                None => out.push_str(&rest[start..end]),
            }
            rest = &rest[end..];
        }
        out.push_str(rest);
        out
    }

    // -- snapshots ----------------------------------------------------------

    /// Total serialized size of the context in bytes.
    pub fn total_size(&self) -> usize {
        self.read().total_size()
    }

    /// Serialize the whole context, e.g. for a run artifact.
    pub fn to_json(&self) -> Value {
        let data = self.read();
        let steps: Map<String, Value> = data
            .step_outputs
            .iter()
            .map(|(id, output)| (id.clone(), json!({ "output": output })))
            .collect();
        json!({
            "steps": steps,
            "variables": data.variables,
            "resources": data.resources,
        })
    }
}

impl std::fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.read();
        f.debug_struct("WorkflowContext")
            .field("steps", &data.step_outputs.len())
            .field("variables", &data.variables.len())
            .field("resources", &data.resources.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn lookup(data: &ContextData, expr: &str) -> Option<String> {
    if let Some(path) = expr.strip_prefix("steps.") {
        let id = path.strip_suffix(".output")?;
        return data.step_outputs.get(id).map(value_to_string);
    }
    if let Some(name) = expr.strip_prefix("variables.") {
        return data.variables.get(name).map(value_to_string);
    }
    if let Some(name) = expr.strip_prefix("resources.") {
        return data.resources.get(name).cloned();
    }
    None
}

fn serialized_len(value: &Value) -> usize {
    serde_json::to_string(value).map(|s| s.len()).unwrap_or(0)
}

/// Convert a JSON value to a display string for template resolution.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let ctx = WorkflowContext::new();
        let other = ctx.clone();
        other.set_variable("migration_id", json!("m-42"));
        assert_eq!(ctx.variable_str("migration_id").as_deref(), Some("m-42"));
    }

    #[test]
    fn test_set_and_get_step_output() {
        let ctx = WorkflowContext::new();
        ctx.set_step_output("list", json!(["a", "b"])).unwrap();
        assert_eq!(ctx.step_output("list"), Some(json!(["a", "b"])));
        assert_eq!(ctx.step_output("missing"), None);
        assert!(ctx.has_step_output("list"));
    }

    #[test]
    fn test_resolve_templates() {
        let ctx = WorkflowContext::with_variables([("target", json!("vault-b"))]);
        ctx.set_step_output("count", json!(3)).unwrap();
        ctx.set_resource_status("secret/db", "migrated");

        let result = ctx.resolve_template(
            "copied {{ steps.count.output }} to {{variables.target}} ({{ resources.secret/db }})",
        );
        assert_eq!(result, "copied 3 to vault-b (migrated)");
    }

    #[test]
    fn test_unknown_reference_left_as_is() {
        let ctx = WorkflowContext::new();
        let template = "value: {{ steps.nope.output }} and {{ trigger.x }}";
        assert_eq!(ctx.resolve_template(template), template);
        assert_eq!(ctx.resolve_template("open {{ brace"), "open {{ brace");
    }

    #[test]
    fn test_oversized_output_is_truncated() {
        let ctx = WorkflowContext::new();
        let large = "x".repeat(MAX_STEP_OUTPUT_SIZE + 100);
        ctx.set_step_output("big", json!(large)).unwrap();

        let output = ctx.step_output("big").unwrap();
        assert_eq!(output["_truncated"], json!(true));
        assert!(ctx.total_size() < MAX_STEP_OUTPUT_SIZE);
    }

    #[test]
    fn test_context_size_limit_rejects_and_keeps_previous() {
        let ctx = WorkflowContext::new();
        let chunk = "y".repeat(MAX_STEP_OUTPUT_SIZE - 16);
        for i in 0..10 {
            ctx.set_step_output(&format!("s{i}"), json!(chunk)).unwrap();
        }
        ctx.set_step_output("s10", json!("small")).unwrap();

        let err = ctx.set_step_output("s10", json!(chunk)).unwrap_err();
        assert!(matches!(err, ContextError::TooLarge { .. }));
        assert_eq!(ctx.step_output("s10"), Some(json!("small")));
        assert_eq!(err.error_kind(), ErrorKind::ResourceExhausted);
    }

    #[test]
    fn test_to_json_snapshot() {
        let ctx = WorkflowContext::new();
        ctx.set_step_output("list", json!(2)).unwrap();
        ctx.set_variable("env", json!("prod"));
        ctx.set_resource_status("bucket/a", "pending");

        let snapshot = ctx.to_json();
        assert_eq!(snapshot["steps"]["list"]["output"], json!(2));
        assert_eq!(snapshot["variables"]["env"], json!("prod"));
        assert_eq!(snapshot["resources"]["bucket/a"], json!("pending"));
    }
}
