//! Shared value types for the engine.
//!
//! Everything here is plain data: no handles, no shared mutability. A
//! `RunContext` is created per invocation and threaded explicitly through the
//! call that owns it.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::ledger::ToolCallLedger;

/// Generate a fresh opaque identifier (correlation ids, idempotency uuids, tokens).
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Use the caller's identifier when present and non-blank, otherwise mint one.
pub fn id_or_new(id: Option<&str>) -> String {
    match id.map(str::trim).filter(|s| !s.is_empty()) {
        Some(id) => id.to_string(),
        None => new_id(),
    }
}

/// Request-scoped identity of one engine invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub correlation_id: String,
    pub task_id: Option<String>,
    pub branch: Option<String>,
    /// Model currently used for generation; only the owning engine changes it.
    pub model_used: String,
    #[serde(default)]
    pub ledger: ToolCallLedger,
}

impl RunContext {
    pub fn new(correlation_id: impl Into<String>, model_used: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            task_id: None,
            branch: None,
            model_used: model_used.into(),
            ledger: ToolCallLedger::default(),
        }
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_branch(mut self, branch: Option<String>) -> Self {
        self.branch = branch;
        self
    }
}

/// One generate/evaluate round. Immutable once appended to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Iteration {
    /// 1-indexed position within the run.
    pub iteration: u32,
    pub output: String,
    pub model_used: String,
}

/// Conductor pipeline state carried between stages.
///
/// Kept flat (strings, bools, lists) so it can be cloned, compared, and
/// serialized freely. Stages receive it by reference and hand back a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConductorState {
    pub task: String,
    pub idempotency_uuid: String,
    pub correlation_id: String,
    pub escalation_used: bool,
    pub iterations: Vec<Iteration>,
    /// Stage tags in execution order (`outliner`, `refiner:1`, `reviewer`).
    pub steps: Vec<String>,
}

impl ConductorState {
    pub fn new(
        task: impl Into<String>,
        idempotency_uuid: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            task: task.into(),
            idempotency_uuid: idempotency_uuid.into(),
            correlation_id: correlation_id.into(),
            escalation_used: false,
            iterations: Vec::new(),
            steps: Vec::new(),
        }
    }

    /// Latest generated output, if any stage produced one.
    pub fn last_output(&self) -> Option<&str> {
        self.iterations.last().map(|it| it.output.as_str())
    }

    pub fn next_iteration_number(&self) -> u32 {
        self.iterations.len() as u32 + 1
    }
}
