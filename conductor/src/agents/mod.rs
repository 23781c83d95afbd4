//! Conductor stages and their static registry.
//!
//! The set of stages is closed ([`StageKind`]), so lookup is a `match` rather
//! than name resolution at runtime. Each stage takes the current
//! [`ConductorState`] by reference and returns a new one.

use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::core::budget::Deadline;
use crate::core::types::ConductorState;
use crate::io::config::IterationConfig;

pub mod llm;
pub mod prompts;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Outliner,
    Refiner,
    Reviewer,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Outliner => "outliner",
            Self::Refiner => "refiner",
            Self::Reviewer => "reviewer",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scheduled execution of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSlot {
    pub kind: StageKind,
    /// 1-based refiner pass; `None` for the other stages.
    pub index: Option<u32>,
}

impl StageSlot {
    /// `outliner`, `refiner:2`, `reviewer`.
    pub fn tag(&self) -> String {
        match self.index {
            Some(index) => format!("{}:{index}", self.kind),
            None => self.kind.to_string(),
        }
    }
}

/// Outliner, `refiners` refiner passes, reviewer.
pub fn stage_plan(refiners: u32) -> Vec<StageSlot> {
    let mut plan = vec![StageSlot {
        kind: StageKind::Outliner,
        index: None,
    }];
    plan.extend((1..=refiners).map(|i| StageSlot {
        kind: StageKind::Refiner,
        index: Some(i),
    }));
    plan.push(StageSlot {
        kind: StageKind::Reviewer,
        index: None,
    });
    plan
}

/// Everything a stage may read besides the state.
#[derive(Debug, Clone)]
pub struct StageContext<'a> {
    pub slot: StageSlot,
    pub refiner_total: u32,
    /// Checked at safe points; overrunning turns the stage into an error.
    pub deadline: Deadline,
    pub model: &'a str,
    pub escalation_model: &'a str,
    pub thresholds: &'a IterationConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Ok,
    /// The stage ran but its result is not acceptable.
    Rejected,
    /// The stage failed or overran its deadline; state is unchanged.
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageResult {
    pub status: StageStatus,
    pub state: ConductorState,
    pub detail: Option<String>,
}

impl StageResult {
    pub fn ok(state: ConductorState) -> Self {
        Self {
            status: StageStatus::Ok,
            state,
            detail: None,
        }
    }

    pub fn rejected(state: ConductorState, detail: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Rejected,
            state,
            detail: Some(detail.into()),
        }
    }
}

pub trait Stage {
    fn run(&self, state: &ConductorState, ctx: &StageContext<'_>) -> Result<StageResult>;
}

/// Fixed mapping from [`StageKind`] to its implementation.
#[derive(Clone, Copy)]
pub struct StageRegistry<'a> {
    outliner: &'a dyn Stage,
    refiner: &'a dyn Stage,
    reviewer: &'a dyn Stage,
}

impl<'a> StageRegistry<'a> {
    pub fn new(outliner: &'a dyn Stage, refiner: &'a dyn Stage, reviewer: &'a dyn Stage) -> Self {
        Self {
            outliner,
            refiner,
            reviewer,
        }
    }

    /// One implementation serving every kind (it dispatches on `ctx.slot`).
    pub fn uniform(stage: &'a dyn Stage) -> Self {
        Self::new(stage, stage, stage)
    }

    pub fn get(&self, kind: StageKind) -> &'a dyn Stage {
        match kind {
            StageKind::Outliner => self.outliner,
            StageKind::Refiner => self.refiner,
            StageKind::Reviewer => self.reviewer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_orders_outliner_refiners_reviewer() {
        let tags: Vec<String> = stage_plan(3).iter().map(StageSlot::tag).collect();
        assert_eq!(
            tags,
            vec!["outliner", "refiner:1", "refiner:2", "refiner:3", "reviewer"]
        );
        assert_eq!(stage_plan(0).len(), 2);
    }

    struct Named(&'static str);

    impl Stage for Named {
        fn run(&self, state: &ConductorState, _ctx: &StageContext<'_>) -> Result<StageResult> {
            let mut next = state.clone();
            next.steps.push(self.0.to_string());
            Ok(StageResult::ok(next))
        }
    }

    #[test]
    fn registry_resolves_each_kind() {
        let (a, b, c) = (Named("a"), Named("b"), Named("c"));
        let registry = StageRegistry::new(&a, &b, &c);
        let thresholds = IterationConfig::default();
        let ctx = StageContext {
            slot: StageSlot {
                kind: StageKind::Reviewer,
                index: None,
            },
            refiner_total: 0,
            deadline: Deadline::after(std::time::Duration::from_secs(1)),
            model: "m",
            escalation_model: "e",
            thresholds: &thresholds,
        };
        let state = ConductorState::new("t", "u", "c");
        let result = registry
            .get(StageKind::Reviewer)
            .run(&state, &ctx)
            .expect("run");
        assert_eq!(result.state.steps, vec!["c"]);
    }
}
