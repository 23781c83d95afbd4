//! Per-run bookkeeping of tool calls, enforced before any tool body runs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::violations::GuardrailViolation;

/// Tool-call counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallLedger {
    /// Current conversation turn (starts at 0).
    pub turn: u32,
    /// Calls per tool, keyed by turn.
    pub calls: BTreeMap<String, BTreeMap<u32, u32>>,
    pub retry_count: u32,
    /// Exit status of the most recent recorded test run.
    pub last_test_exit: Option<i32>,
}

impl ToolCallLedger {
    /// Advance to the next conversation turn. Counters of earlier turns are kept.
    pub fn begin_turn(&mut self) -> u32 {
        self.turn += 1;
        self.turn
    }

    pub fn calls_this_turn(&self, tool: &str) -> u32 {
        self.calls
            .get(tool)
            .and_then(|turns| turns.get(&self.turn))
            .copied()
            .unwrap_or(0)
    }

    /// Count one call of `tool` in the current turn, failing once `limit` is exceeded.
    ///
    /// A rejected call is not recorded.
    pub fn record_call(&mut self, tool: &str, limit: u32) -> Result<u32, GuardrailViolation> {
        let next = self.calls_this_turn(tool) + 1;
        if next > limit {
            return Err(GuardrailViolation::TooManyCalls {
                tool: tool.to_string(),
                turn: self.turn,
                limit,
            });
        }
        self.calls
            .entry(tool.to_string())
            .or_default()
            .insert(self.turn, next);
        Ok(next)
    }

    /// Count one retry, failing once `limit` is exceeded.
    pub fn record_retry(&mut self, limit: u32) -> Result<u32, GuardrailViolation> {
        if self.retry_count + 1 > limit {
            return Err(GuardrailViolation::TooManyRetries { limit });
        }
        self.retry_count += 1;
        Ok(self.retry_count)
    }

    pub fn record_test_exit(&mut self, exit_code: Option<i32>) {
        self.last_test_exit = exit_code;
    }

    pub fn tests_green(&self) -> bool {
        self.last_test_exit == Some(0)
    }
}
