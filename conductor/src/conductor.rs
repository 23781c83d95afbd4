//! Multi-stage pipeline with a failure-streak circuit breaker.
//!
//! Stages run strictly in order (outliner, refiner ×N, reviewer). A stage that
//! errors or overruns its cooperative deadline leaves the state as it was and
//! counts toward the failure streak; reaching the streak limit stops the run
//! with a `fallback` result.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::agents::{StageContext, StageRegistry, StageSlot, StageStatus, stage_plan};
use crate::core::budget::{Deadline, DeadlineExceeded};
use crate::core::routing::{RouteRequest, route};
use crate::core::types::{ConductorState, id_or_new};
use crate::io::config::{EngineConfig, Toggles};

#[derive(Debug, Clone, Default)]
pub struct ConductorRequest {
    pub task: String,
    pub branch: Option<String>,
    pub correlation_id: Option<String>,
    pub idempotency_uuid: Option<String>,
    /// Defaults to `conductor.refiner_iterations`.
    pub refiner_iterations: Option<u32>,
    /// Defaults to `conductor.max_jobs`.
    pub max_jobs: Option<u32>,
}

impl ConductorRequest {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Self::default()
        }
    }
}

/// What happened to one scheduled stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageRecord {
    pub stage: String,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConductorReason {
    MaxJobsExceeded,
    CircuitBreaker,
    EmptyTask,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConductorOutcome {
    Completed {
        state: ConductorState,
        stages: Vec<StageRecord>,
        elapsed_ms: u64,
    },
    Aborted {
        reason: ConductorReason,
        requested_jobs: u32,
        max_jobs: u32,
        state: ConductorState,
    },
    Fallback {
        reason: ConductorReason,
        state: ConductorState,
        stages: Vec<StageRecord>,
    },
    Error {
        reason: ConductorReason,
        state: ConductorState,
    },
}

impl ConductorOutcome {
    pub fn state(&self) -> &ConductorState {
        match self {
            Self::Completed { state, .. }
            | Self::Aborted { state, .. }
            | Self::Fallback { state, .. }
            | Self::Error { state, .. } => state,
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Aborted { .. } => "aborted",
            Self::Fallback { .. } => "fallback",
            Self::Error { .. } => "error",
        }
    }
}

pub struct ConductorPipeline<'a> {
    registry: StageRegistry<'a>,
    config: EngineConfig,
    toggles: Toggles,
}

impl<'a> ConductorPipeline<'a> {
    pub fn new(registry: StageRegistry<'a>, config: EngineConfig) -> Self {
        Self {
            registry,
            config,
            toggles: Toggles::default(),
        }
    }

    pub fn with_toggles(mut self, toggles: Toggles) -> Self {
        self.toggles = toggles;
        self
    }

    #[instrument(skip_all, fields(correlation_id = request.correlation_id.as_deref().unwrap_or("")))]
    pub fn conductor(&self, request: &ConductorRequest) -> ConductorOutcome {
        let started = Instant::now();
        let mut state = ConductorState::new(
            request.task.clone(),
            id_or_new(request.idempotency_uuid.as_deref()),
            id_or_new(request.correlation_id.as_deref()),
        );
        if request.task.trim().is_empty() {
            warn!("conductor called with an empty task");
            return ConductorOutcome::Error {
                reason: ConductorReason::EmptyTask,
                state,
            };
        }

        let cfg = &self.config.conductor;
        let refiners = request.refiner_iterations.unwrap_or(cfg.refiner_iterations);
        let max_jobs = request.max_jobs.unwrap_or(cfg.max_jobs);
        let requested_jobs = refiners.saturating_add(2);
        if requested_jobs > max_jobs {
            warn!(requested_jobs, max_jobs, "refusing to start: too many jobs");
            return ConductorOutcome::Aborted {
                reason: ConductorReason::MaxJobsExceeded,
                requested_jobs,
                max_jobs,
                state,
            };
        }

        let model = route(&RouteRequest::for_text(&request.task), &self.config.routing).model_id;
        let escalation_model = self
            .toggles
            .escalate_llm
            .clone()
            .unwrap_or_else(|| self.config.iteration.escalation_model.clone());
        info!(model = %model, requested_jobs, "conductor starting");

        let mut stages = Vec::with_capacity(requested_jobs as usize);
        let mut streak = 0u32;
        for slot in stage_plan(refiners) {
            let ctx = StageContext {
                slot,
                refiner_total: refiners,
                deadline: Deadline::after(Duration::from_millis(cfg.stage_timeout_ms)),
                model: &model,
                escalation_model: &escalation_model,
                thresholds: &self.config.iteration,
            };
            let record = self.run_stage(&mut state, &ctx);
            if record.status == StageStatus::Ok {
                streak = 0;
            } else {
                streak += 1;
            }
            stages.push(record);

            if streak >= cfg.failure_streak_limit {
                warn!(stage = %slot.tag(), streak, "circuit breaker tripped");
                return ConductorOutcome::Fallback {
                    reason: ConductorReason::CircuitBreaker,
                    state,
                    stages,
                };
            }
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(elapsed_ms, "conductor completed");
        ConductorOutcome::Completed {
            state,
            stages,
            elapsed_ms,
        }
    }

    /// Run one stage, replacing `state` only when the stage returned in time.
    fn run_stage(&self, state: &mut ConductorState, ctx: &StageContext<'_>) -> StageRecord {
        let tag = ctx.slot.tag();
        let stage = self.registry.get(ctx.slot.kind);
        let error = |detail: String| StageRecord {
            stage: tag.clone(),
            status: StageStatus::Error,
            detail: Some(detail),
        };

        match stage.run(state, ctx) {
            Ok(_) if ctx.deadline.is_expired() => {
                warn!(stage = %tag, budget_ms = ctx.deadline.budget().as_millis() as u64, "stage overran its deadline");
                error(
                    DeadlineExceeded {
                        budget: ctx.deadline.budget(),
                    }
                    .to_string(),
                )
            }
            Ok(result) => {
                debug!(stage = %tag, status = ?result.status, "stage finished");
                let record = StageRecord {
                    stage: tag.clone(),
                    status: result.status,
                    detail: result.detail,
                };
                if result.status != StageStatus::Error {
                    *state = result.state;
                }
                record
            }
            Err(err) => {
                if err.downcast_ref::<DeadlineExceeded>().is_some() {
                    warn!(stage = %tag, "stage hit its deadline");
                } else {
                    warn!(stage = %tag, error = %err, "stage failed");
                }
                error(format!("{err:#}"))
            }
        }
    }
}

/// Slot helper for callers that want to preview the schedule.
pub fn planned_stages(refiner_iterations: u32) -> Vec<String> {
    stage_plan(refiner_iterations)
        .iter()
        .map(StageSlot::tag)
        .collect()
}
