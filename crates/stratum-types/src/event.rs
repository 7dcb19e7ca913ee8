//! Event types for the runtime event bus.
//!
//! `RuntimeEvent` is broadcast by the workflow engine, circuit breakers and
//! batch processors. All variants are Clone + Send + Sync for use with tokio
//! broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::CircuitState;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    WorkflowRunStarted {
        run_id: Uuid,
        workflow_name: String,
        total_steps: usize,
    },

    WorkflowStepStarted {
        run_id: Uuid,
        step_id: String,
        step_name: String,
        attempt: u32,
    },

    WorkflowStepCompleted {
        run_id: Uuid,
        step_id: String,
        duration_ms: u64,
    },

    WorkflowStepFailed {
        run_id: Uuid,
        step_id: String,
        error: String,
        will_retry: bool,
    },

    WorkflowStepSkipped { run_id: Uuid, step_id: String },

    WorkflowRunCompleted {
        run_id: Uuid,
        workflow_name: String,
        duration_ms: u64,
        steps_completed: usize,
        steps_failed: usize,
    },

    /// The run aborted: a required step failed, it timed out, or it was cancelled.
    WorkflowRunFailed {
        run_id: Uuid,
        workflow_name: String,
        error: String,
    },

    CircuitStateChanged {
        name: String,
        from: CircuitState,
        to: CircuitState,
    },

    BatchFlushed {
        processor: String,
        size: usize,
        succeeded: usize,
        requeued: usize,
        failed: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = RuntimeEvent::CircuitStateChanged {
            name: "secret-access".to_string(),
            from: CircuitState::Closed,
            to: CircuitState::Open,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "circuit_state_changed");
        assert_eq!(json["to"], "open");
    }
}
